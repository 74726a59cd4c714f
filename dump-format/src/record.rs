use std::fmt;

/// A fully resolved basic-block record: module-relative offset plus source
/// location, as written by the resolver and by `.binaryrts` symbol files.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SymbolRecord {
    pub offset: u64,
    pub file: String,
    pub name: String,
    pub line: u64,
}

impl fmt::Display for SymbolRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\t+0x{:x}\t{}\t{}\t{}",
            self.offset, self.file, self.name, self.line
        )
    }
}
