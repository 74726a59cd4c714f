use std::io::{self, Write};

use crate::record::SymbolRecord;

pub fn module_header<W: Write + ?Sized>(w: &mut W, name: &str, path: &str) -> io::Result<()> {
    writeln!(w, "{name}\t{path}")
}

pub fn text_block<W: Write + ?Sized>(w: &mut W, offset: u64, data: u64) -> io::Result<()> {
    writeln!(w, "\t+0x{offset:x}\t{data}")
}

pub fn symbol_record<W: Write + ?Sized>(w: &mut W, record: &SymbolRecord) -> io::Result<()> {
    writeln!(w, "{record}")
}

/// Write one binary offsets run: the count marker, the raw pointer-width
/// offsets, and the terminating newline.
pub fn offsets_run<W: Write + ?Sized>(w: &mut W, offsets: &[usize]) -> io::Result<()> {
    writeln!(w, "\tBBs: {}", offsets.len())?;
    for offset in offsets {
        w.write_all(&offset.to_ne_bytes())?;
    }
    writeln!(w)
}

/// Write the opened-files companion: one captured path per line.
pub fn opened_files<W: Write + ?Sized>(w: &mut W, paths: &[String]) -> io::Result<()> {
    for path in paths {
        writeln!(w, "{path}")?;
    }
    Ok(())
}
