//! Contracts between the engine and the instrumentation host.
//!
//! The host owns process control: it enumerates modules, emits basic blocks
//! into its code cache, intercepts syscalls, and routes nudges between
//! processes. The engine only reacts, and everything it needs from the host
//! goes through these types.

use std::sync::Arc;

use anyhow::Result;

use crate::block::BlockEntry;

/// A module the host has observed loading or unloading.
///
/// `checksum` and `timestamp` are zero on platforms that do not provide
/// them; the reload check then degenerates to the address and name fields.
#[derive(Clone, Debug)]
pub struct ModuleDescriptor {
    /// Preferred display name. Some modules have none.
    pub name: Option<String>,
    /// Full filesystem path of the image.
    pub path: String,
    pub start: u64,
    pub end: u64,
    pub entry_point: u64,
    pub checksum: u32,
    pub timestamp: u32,
    pub preferred_base: u64,
}

/// A basic block the host is about to commit to its code cache.
#[derive(Clone, Copy, Debug)]
pub struct BasicBlock {
    /// Application pc of the first instruction.
    pub start_pc: u64,
    /// Application pc of the last instruction.
    pub last_instr_pc: u64,
}

impl BasicBlock {
    pub fn size(&self) -> u64 {
        self.last_instr_pc.saturating_sub(self.start_pc)
    }
}

/// What the host must weave into the block it is emitting.
#[derive(Clone)]
pub enum Instrumentation {
    /// Leave the block unmodified.
    None,

    /// Prepend an inline increment of the counter word, saving and restoring
    /// the arithmetic flags around it. The increment must not be made
    /// atomic: any nonzero count suffices, and a lost update cannot move a
    /// counter from zero to zero.
    InlineIncrement { counter: Arc<BlockEntry> },

    /// Prepend a clean call to a helper performing a plain increment, for
    /// targets where the inline form is not available.
    CleanCall { counter: Arc<BlockEntry> },
}

/// Read-only view of an intercepted syscall.
///
/// `path_param` marshals the parameter at `index` into a path string
/// (C string on POSIX, `UNICODE_STRING` in the object attributes on
/// Windows); `None` when the argument is null or unreadable.
pub trait SyscallView {
    fn sysnum(&self) -> i32;
    fn path_param(&self, index: usize) -> Option<String>;
}

/// Platform syscall numbers for the file-open family.
///
/// `openat` doubles as `NtCreateFile` on Windows; its path argument index
/// differs from `open`, which the capture path accounts for.
#[derive(Clone, Copy, Debug)]
pub struct OpenSyscalls {
    pub open: i32,
    pub openat: Option<i32>,
}

/// Services the engine requires from its host.
pub trait DbiHost: Send + Sync {
    /// Value of a host runtime option, if known.
    fn integer_option(&self, name: &str) -> Option<u64>;

    /// Syscall numbers to trace for file opens.
    fn open_syscalls(&self) -> OpenSyscalls;

    /// Deliver a nudge payload to another process under host control.
    fn nudge(&self, pid: u32, argument: u64) -> Result<()>;

    /// Terminate the current process with the given exit code.
    fn exit_process(&self, exit_code: i32);
}
