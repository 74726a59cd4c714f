//! In-process basic-block coverage for regression test selection.
//!
//! The engine runs embedded in an instrumented application. It tracks loaded
//! modules, records which basic blocks of which modules execute, and dumps
//! per-test coverage files whenever the application signals a test boundary
//! through the host's log annotation. Offline tools later resolve the dumped
//! offsets into symbols or line coverage.

use std::path::PathBuf;

use thiserror::Error;

pub mod block;
mod dump;
mod engine;
pub mod host;
pub mod modules;
mod syscalls;

pub use engine::CoverageEngine;
pub use host::{BasicBlock, DbiHost, Instrumentation, ModuleDescriptor, OpenSyscalls, SyscallView};
pub use modules::ThreadContext;

/// Name of the host annotation the application fires at test boundaries,
/// carrying a single string argument (the dump id).
pub const LOG_ANNOTATION: &str = "dynamorio_annotate_log";

/// Low word of a terminate nudge; the high word carries the exit code.
pub const NUDGE_TERMINATE_PROCESS: u64 = 1;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("host must be configured with block elision disabled")]
    ElisionEnabled,

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Engine configuration, normally parsed from the host's client options
/// string.
#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Directory for dump files; defaults to the current directory.
    pub logdir: Option<PathBuf>,

    /// Path of the final whole-run dump; defaults to `coverage.log` in the
    /// log directory.
    pub output: Option<PathBuf>,

    /// Newline-separated allow-list of module names to instrument.
    pub modules_file: Option<PathBuf>,

    /// Dump text records instead of the binary format.
    pub text_dump: bool,

    /// Resolve symbols while dumping (implies `text_dump`).
    pub resolve_symbols: bool,

    /// Instrument blocks with hit-count increments so per-test dumps carry
    /// per-execution counts.
    pub runtime_dump: bool,

    /// Record block sizes instead of hit counts. Only meaningful with
    /// `text_dump`; the output feeds the line-coverage visualiser.
    pub dump_bb_size: bool,

    /// Trace file-open syscalls into a `.syscalls` companion per dump.
    pub syscalls: bool,

    pub verbose: u32,
}

impl Options {
    /// Parse a host client options string, e.g.
    /// `-logdir /tmp/cov -runtime_dump -text_dump`.
    pub fn parse(args: &str) -> Result<Self, SetupError> {
        let mut options = Self::default();
        let mut tokens = args.split_whitespace();

        while let Some(token) = tokens.next() {
            match token {
                "-logdir" => options.logdir = Some(value(&mut tokens, token)?.into()),
                "-output" => options.output = Some(value(&mut tokens, token)?.into()),
                "-modules" => options.modules_file = Some(value(&mut tokens, token)?.into()),
                "-text_dump" => options.text_dump = true,
                "-symbols" => {
                    options.resolve_symbols = true;
                    options.text_dump = true;
                }
                "-runtime_dump" => options.runtime_dump = true,
                "-dump_bb_size" => options.dump_bb_size = true,
                "-syscalls" => options.syscalls = true,
                "-verbose" => {
                    let argument = value(&mut tokens, token)?;
                    options.verbose = argument.parse().map_err(|_| {
                        SetupError::InvalidOption(format!("invalid -verbose number {argument:?}"))
                    })?;
                }
                unknown => {
                    return Err(SetupError::InvalidOption(format!(
                        "unrecognized option {unknown:?}"
                    )))
                }
            }
        }

        Ok(options)
    }
}

fn value<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    flag: &str,
) -> Result<&'a str, SetupError> {
    tokens
        .next()
        .ok_or_else(|| SetupError::InvalidOption(format!("missing argument for {flag}")))
}
