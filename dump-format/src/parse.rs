use std::io::{self, BufRead};
use std::mem;

use nom::bytes::complete::{tag, take_till1, take_while1};
use nom::character::complete::u64 as decimal;
use nom::combinator::{eof, map, map_res, opt};
use nom::sequence::preceded;
use nom::IResult;
use thiserror::Error;

use crate::record::SymbolRecord;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed record at line {line_number}: {line:?}")]
    InvalidRecord { line_number: u64, line: String },

    #[error("truncated offset run: expected {expected} offsets")]
    TruncatedRun { expected: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One parsed element of a dump file.
#[derive(Clone, Debug, PartialEq)]
pub enum DumpEvent {
    /// A module header line, `<name>\t<path>`.
    Module { name: String, path: String },

    /// A text-format block record. `data` is the block's hit count, or its
    /// size in bytes when the dump was taken in size-recording mode; the
    /// file does not say which.
    Block { offset: u64, data: u64 },

    /// A symbolic block record.
    Symbol(SymbolRecord),

    /// One run of raw pointer-width block offsets (binary format).
    Offsets(Vec<u64>),
}

/// Streaming dump reader.
///
/// The format is line-oriented except for the raw offset runs, so the reader
/// toggles between "expect a module header" and "expect block records" and
/// drops to a byte-exact read when it sees a `\tBBs: <N>` marker.
pub struct DumpReader<R> {
    inner: R,
    line_number: u64,
    in_module: bool,
}

impl<R: BufRead> DumpReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line_number: 0,
            in_module: false,
        }
    }

    fn read_offsets(&mut self, count: usize) -> Result<Vec<u64>, ParseError> {
        let mut offsets = Vec::with_capacity(count);
        let mut word = [0u8; mem::size_of::<usize>()];

        for _ in 0..count {
            self.inner
                .read_exact(&mut word)
                .map_err(|err| match err.kind() {
                    io::ErrorKind::UnexpectedEof => ParseError::TruncatedRun { expected: count },
                    _ => ParseError::Io(err),
                })?;
            offsets.push(usize::from_ne_bytes(word) as u64);
        }

        // The engine terminates each run with a single newline.
        let mut newline = [0u8; 1];
        match self.inner.read_exact(&mut newline) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {}
            Err(err) => return Err(ParseError::Io(err)),
        }

        Ok(offsets)
    }
}

impl<R: BufRead> Iterator for DumpReader<R> {
    type Item = Result<DumpEvent, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut raw = Vec::new();
            match self.inner.read_until(b'\n', &mut raw) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(err.into())),
            }
            self.line_number += 1;

            let text = String::from_utf8_lossy(&raw);
            let line = text.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                continue;
            }

            if !line.starts_with('\t') {
                // Module header. Lines without a separator are ignored.
                if let Some((name, path)) = line.split_once('\t') {
                    self.in_module = true;
                    return Some(Ok(DumpEvent::Module {
                        name: name.to_owned(),
                        path: path.to_owned(),
                    }));
                }
                continue;
            }

            if !self.in_module {
                // A record before any module header has nothing to belong to.
                continue;
            }

            if line.starts_with("\t+") {
                match block_line(line) {
                    Ok((_, event)) => return Some(Ok(event)),
                    Err(_) => {
                        return Some(Err(ParseError::InvalidRecord {
                            line_number: self.line_number,
                            line: line.to_owned(),
                        }))
                    }
                }
            } else if let Ok((_, count)) = offsets_marker(line) {
                self.in_module = false;
                return Some(self.read_offsets(count).map(DumpEvent::Offsets));
            }
            // Any other tab-indented line is noise; skip it.
        }
    }
}

/// Parse a single symbolic record line (the `.binaryrts` file grammar).
pub fn symbol_line(line: &str) -> Result<SymbolRecord, ParseError> {
    let line = line.trim_end_matches(['\n', '\r']);
    match block_line(line) {
        Ok((_, DumpEvent::Symbol(record))) => Ok(record),
        _ => Err(ParseError::InvalidRecord {
            line_number: 0,
            line: line.to_owned(),
        }),
    }
}

fn hex_offset(input: &str) -> IResult<&str, u64> {
    let (input, _) = tag("+")(input)?;
    let (input, _) = opt(tag("0x"))(input)?;
    map_res(
        take_while1(|c: char| c.is_ascii_hexdigit()),
        |digits: &str| u64::from_str_radix(digits, 16),
    )(input)
}

fn field(input: &str) -> IResult<&str, &str> {
    take_till1(|c| c == '\t')(input)
}

fn block_line(input: &str) -> IResult<&str, DumpEvent> {
    let (rest, _) = tag("\t")(input)?;
    let (rest, offset) = hex_offset(rest)?;

    // Offset only.
    if rest.is_empty() {
        return Ok((rest, DumpEvent::Block { offset, data: 0 }));
    }

    // `\t<file>\t<name>\t<line>`
    if let Ok((rest, (file, name, line))) = symbol_fields(rest) {
        return Ok((
            rest,
            DumpEvent::Symbol(SymbolRecord {
                offset,
                file: file.to_owned(),
                name: name.to_owned(),
                line,
            }),
        ));
    }

    // `\t<data>`
    let (rest, data) = preceded(tag("\t"), decimal)(rest)?;
    let (rest, _) = eof(rest)?;
    Ok((rest, DumpEvent::Block { offset, data }))
}

fn symbol_fields(input: &str) -> IResult<&str, (&str, &str, u64)> {
    let (input, file) = preceded(tag("\t"), field)(input)?;
    let (input, name) = preceded(tag("\t"), field)(input)?;
    let (input, line) = preceded(tag("\t"), decimal)(input)?;
    let (input, _) = eof(input)?;
    Ok((input, (file, name, line)))
}

fn offsets_marker(input: &str) -> IResult<&str, usize> {
    let (input, _) = tag("\tBBs: ")(input)?;
    let (input, count) = map(decimal, |n| n as usize)(input)?;
    let (input, _) = eof(input)?;
    Ok((input, count))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::write;

    fn read_all(data: &[u8]) -> Vec<DumpEvent> {
        DumpReader::new(Cursor::new(data))
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn parse_text_dump() {
        let events = read_all(b"app\t/path/app\n\t+0x1000\t1\n\t+0x2000\t3\n");

        assert_eq!(
            events,
            vec![
                DumpEvent::Module {
                    name: "app".into(),
                    path: "/path/app".into(),
                },
                DumpEvent::Block {
                    offset: 0x1000,
                    data: 1,
                },
                DumpEvent::Block {
                    offset: 0x2000,
                    data: 3,
                },
            ]
        );
    }

    #[test]
    fn parse_symbolic_dump() {
        let events = read_all(b"app\t/path/app\n\t+0x10\t/src/foo.cpp\tfoo()\t42\n");

        assert_eq!(
            events,
            vec![
                DumpEvent::Module {
                    name: "app".into(),
                    path: "/path/app".into(),
                },
                DumpEvent::Symbol(SymbolRecord {
                    offset: 0x10,
                    file: "/src/foo.cpp".into(),
                    name: "foo()".into(),
                    line: 42,
                }),
            ]
        );
    }

    #[test]
    fn parse_binary_dump() {
        let mut data = Vec::new();
        write::module_header(&mut data, "app", "/path/app").unwrap();
        write::offsets_run(&mut data, &[0x1000, 0x2000]).unwrap();
        write::module_header(&mut data, "libfoo.so", "/path/libfoo.so").unwrap();
        write::offsets_run(&mut data, &[0x30]).unwrap();

        let events = read_all(&data);

        assert_eq!(
            events,
            vec![
                DumpEvent::Module {
                    name: "app".into(),
                    path: "/path/app".into(),
                },
                DumpEvent::Offsets(vec![0x1000, 0x2000]),
                DumpEvent::Module {
                    name: "libfoo.so".into(),
                    path: "/path/libfoo.so".into(),
                },
                DumpEvent::Offsets(vec![0x30]),
            ]
        );
    }

    #[test]
    fn truncated_offset_run() {
        let mut data = Vec::new();
        write::module_header(&mut data, "app", "/path/app").unwrap();
        data.extend_from_slice(b"\tBBs: 4\n");
        data.extend_from_slice(&0x1000usize.to_ne_bytes());

        let result: Result<Vec<_>, _> = DumpReader::new(Cursor::new(data)).collect();
        assert!(matches!(
            result,
            Err(ParseError::TruncatedRun { expected: 4 })
        ));
    }

    #[test]
    fn records_before_header_are_skipped() {
        let events = read_all(b"\t+0x1000\t1\napp\t/path/app\n\t+0x2000\t1\n");

        assert_eq!(
            events,
            vec![
                DumpEvent::Module {
                    name: "app".into(),
                    path: "/path/app".into(),
                },
                DumpEvent::Block {
                    offset: 0x2000,
                    data: 1,
                },
            ]
        );
    }

    #[test]
    fn malformed_record_is_an_error() {
        let mut reader = DumpReader::new(Cursor::new(b"app\t/path/app\n\t+0xzz\t1\n".to_vec()));

        assert!(matches!(reader.next(), Some(Ok(DumpEvent::Module { .. }))));
        assert!(matches!(
            reader.next(),
            Some(Err(ParseError::InvalidRecord { line_number: 2, .. }))
        ));
    }

    #[test]
    fn symbol_line_roundtrip() {
        let record = SymbolRecord {
            offset: 0x52630,
            file: "/src/bar.cpp".into(),
            name: "bar(int)".into(),
            line: 7,
        };

        let parsed = symbol_line(&record.to_string()).unwrap();
        assert_eq!(parsed, record);
    }
}
