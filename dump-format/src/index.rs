//! The `dump-lookup.log` index: append-only `<dump-count>;<dump-id>` lines
//! mapping numbered dump files back to test identifiers.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::Result;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexEntry {
    pub dump: u32,
    pub id: String,
}

pub fn append(path: &Path, dump: u32, id: &str) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{dump};{id}")?;
    Ok(())
}

pub fn read(path: &Path) -> Result<Vec<IndexEntry>> {
    let text = fs::read_to_string(path)?;

    let mut entries = Vec::new();
    for line in text.lines() {
        if let Some((dump, id)) = line.split_once(';') {
            entries.push(IndexEntry {
                dump: dump.parse()?,
                id: id.to_owned(),
            });
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn append_then_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(crate::DUMP_LOOKUP_FILE);

        append(&path, 1, "suite.case___PASSED")?;
        append(&path, 2, "suite.other___FAILED")?;

        let entries = read(&path)?;
        assert_eq!(
            entries,
            vec![
                IndexEntry {
                    dump: 1,
                    id: "suite.case___PASSED".into(),
                },
                IndexEntry {
                    dump: 2,
                    id: "suite.other___FAILED".into(),
                },
            ]
        );

        Ok(())
    }
}
