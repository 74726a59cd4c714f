//! On-disk formats shared by the in-process coverage engine and the offline
//! tools.
//!
//! A coverage dump is a sequence of per-module sections. Each section starts
//! with a module header line, followed by basic-block records in one of three
//! shapes:
//!
//! - binary (default): a `\tBBs: <N>` marker line, then `N` raw
//!   pointer-width offsets, then a single newline;
//! - text: one `\t+0x<offset>\t<data>` line per block;
//! - symbolic: one `\t+0x<offset>\t<file>\t<name>\t<line>` line per block.
//!
//! The same symbolic line grammar is used by `.binaryrts` extracted-symbols
//! files. Alongside the dumps live the append-only `dump-lookup.log` index
//! and, when syscall tracing is on, a `.syscalls` companion per dump.

pub mod index;
pub mod parse;
pub mod record;
pub mod write;

pub use parse::{DumpEvent, DumpReader, ParseError};
pub use record::SymbolRecord;

/// Name of the final whole-run dump written at process exit.
pub const FINAL_DUMP_FILE: &str = "coverage.log";

/// Name of the append-only dump index.
pub const DUMP_LOOKUP_FILE: &str = "dump-lookup.log";

/// Suffix appended to a dump file name for its opened-files companion.
pub const SYSCALLS_SUFFIX: &str = "syscalls";

/// Extension of pre-extracted symbol files, `<module-basename>.binaryrts`.
pub const EXTRACTED_SYMBOLS_EXT: &str = "binaryrts";

/// Default extension of per-test dump files.
pub const DEFAULT_DUMP_EXT: &str = ".log";
