use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use dump_format::{index, DUMP_LOOKUP_FILE, FINAL_DUMP_FILE, SYSCALLS_SUFFIX};
use log::{trace, warn};
use symbol_backend::{DebugInfoSource, SymbolSource};

use crate::block::CoverageData;
use crate::dump::{self, DumpRequest};
use crate::host::{BasicBlock, DbiHost, Instrumentation, ModuleDescriptor, SyscallView};
use crate::modules::{self, ModuleTable, ThreadContext};
use crate::syscalls::OpenedFiles;
use crate::{Options, SetupError, NUDGE_TERMINATE_PROCESS};

/// The process-wide coverage engine.
///
/// Constructed once per instrumented process; the host's registration
/// callbacks trampoline through the returned handle. All callbacks may fire
/// on any application thread.
pub struct CoverageEngine {
    host: Arc<dyn DbiHost>,
    options: Options,
    logdir: PathBuf,
    output_path: PathBuf,
    modules: ModuleTable,
    data: CoverageData,
    opened_files: Option<OpenedFiles>,
    symbols: Option<Mutex<DebugInfoSource>>,
    refs: AtomicI32,
    dump_count: AtomicU32,
    nudge_exits: AtomicU32,
}

impl CoverageEngine {
    /// Set up the engine.
    ///
    /// Fails when the host is configured with block elision, since elided
    /// blocks would never reach `on_bb_emit`. An unusable log directory is
    /// not fatal: the engine falls back to the current directory.
    pub fn init(host: Arc<dyn DbiHost>, options: Options) -> Result<Arc<Self>, SetupError> {
        let elide_jmp = host.integer_option("max_elide_jmp");
        let elide_call = host.integer_option("max_elide_call");
        if elide_jmp != Some(0) || elide_call != Some(0) {
            return Err(SetupError::ElisionEnabled);
        }

        let logdir = match &options.logdir {
            Some(dir) => match fs::create_dir_all(dir) {
                Ok(()) => dir.clone(),
                Err(err) => {
                    warn!(
                        "could not create log directory {}, falling back to the current directory: {err}",
                        dir.display()
                    );
                    PathBuf::from(".")
                }
            },
            None => PathBuf::from("."),
        };

        let allowlist = match &options.modules_file {
            Some(path) => match modules::load_allowlist(path) {
                Ok(names) => names,
                Err(err) => {
                    warn!(
                        "modules file {} could not be read, instrumenting all modules: {err}",
                        path.display()
                    );
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let output_path = options
            .output
            .clone()
            .unwrap_or_else(|| logdir.join(FINAL_DUMP_FILE));
        // Surface an unwritable output location at setup, not at exit.
        File::create(&output_path)?;

        let opened_files = options
            .syscalls
            .then(|| OpenedFiles::new(host.open_syscalls()));
        let symbols = options
            .resolve_symbols
            .then(|| Mutex::new(DebugInfoSource::new()));

        Ok(Arc::new(Self {
            host,
            logdir,
            output_path,
            modules: ModuleTable::new(allowlist),
            data: CoverageData::new(),
            opened_files,
            symbols,
            refs: AtomicI32::new(1),
            dump_count: AtomicU32::new(0),
            nudge_exits: AtomicU32::new(0),
            options,
        }))
    }

    /// Re-enter initialization on an existing engine; pairs with one more
    /// `exit`.
    pub fn retain(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Release the engine. The final release writes the whole-run dump.
    pub fn exit(&self) {
        if self.refs.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }

        if let Err(err) = self.final_dump() {
            warn!("final coverage dump failed: {err}");
        }
    }

    /// Called by the host when it is about to commit a block to its code
    /// cache. The return value tells the host what to weave into the block.
    pub fn on_bb_emit(&self, thread: &mut ThreadContext, bb: &BasicBlock) -> Instrumentation {
        let Some(module) = self.modules.lookup(thread, bb.start_pc) else {
            return Instrumentation::None;
        };
        debug_assert!(bb.start_pc >= module.start(), "pc below segment base");

        let offset = (bb.start_pc - module.start()) as u32;
        let (entry, _) = self.data.insert_block(&module, offset);

        if self.options.verbose >= 2 {
            trace!("block +{offset:#x} in {}", module.display_name());
        }

        if !self.options.runtime_dump {
            // Snapshot mode: presence is coverage, and the single dump at
            // exit reports every block ever emitted.
            if self.options.dump_bb_size {
                entry.record(bb.size() as u32);
            } else {
                entry.record(1);
            }
            return Instrumentation::None;
        }

        let instrumentation = if cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
            Instrumentation::InlineIncrement {
                counter: entry.clone(),
            }
        } else {
            Instrumentation::CleanCall {
                counter: entry.clone(),
            }
        };

        // One engine-side increment so a count survives even if the emitted
        // increment loses its race.
        entry.hit();

        instrumentation
    }

    pub fn on_module_load(&self, descriptor: &ModuleDescriptor, is_initial: bool) -> bool {
        self.modules.on_module_load(descriptor, is_initial)
    }

    pub fn on_module_unload(&self, descriptor: &ModuleDescriptor) {
        self.modules.on_module_unload(descriptor);
    }

    /// Test-boundary rendezvous: dump-and-reset to a freshly numbered file
    /// and record the dump id in the index.
    pub fn on_annotation(&self, dump_id: &str) {
        let count = self.dump_count.fetch_add(1, Ordering::SeqCst) + 1;

        let dump_path = self.logdir.join(format!("{count}.log"));
        let file = match File::create(&dump_path) {
            Ok(file) => file,
            Err(err) => {
                warn!("could not create dump file {}: {err}", dump_path.display());
                return;
            }
        };
        let mut writer = BufWriter::new(file);

        let mut syscalls_writer = if self.opened_files.is_some() {
            let path = self.logdir.join(format!("{count}.log.{SYSCALLS_SUFFIX}"));
            match File::create(&path) {
                Ok(file) => Some(BufWriter::new(file)),
                Err(err) => {
                    warn!("could not create syscall log {}: {err}", path.display());
                    None
                }
            }
        } else {
            None
        };

        if let Err(err) = self.dump(
            &mut writer,
            syscalls_writer.as_mut().map(|w| w as &mut dyn Write),
            true,
        ) {
            warn!("coverage dump {count} failed: {err}");
        }

        let index_path = self.logdir.join(DUMP_LOOKUP_FILE);
        if let Err(err) = index::append(&index_path, count, dump_id) {
            warn!("could not update {}: {err}", index_path.display());
        }
    }

    /// Syscall filter: only the file-open family is interesting, and only
    /// when syscall tracing is enabled.
    pub fn on_filter_syscall(&self, sysnum: i32) -> bool {
        self.opened_files
            .as_ref()
            .map_or(false, |opened| opened.is_traced(sysnum))
    }

    /// Pre-syscall hook. Always lets the syscall continue.
    pub fn on_pre_syscall(&self, syscall: &dyn SyscallView) -> bool {
        if let Some(opened) = &self.opened_files {
            opened.capture(syscall);
        }
        true
    }

    /// The host saw a kill request for `pid`. Nudge the target so it can
    /// terminate itself (dumping on the way out); report whether the
    /// originating syscall should be suppressed.
    pub fn on_soft_kill(&self, pid: u32, exit_code: i32) -> bool {
        let argument = NUDGE_TERMINATE_PROCESS | (exit_code as u32 as u64) << 32;

        match self.host.nudge(pid, argument) {
            Ok(()) => true,
            Err(err) => {
                // Target not under host control; let the syscall through.
                warn!("terminate nudge to pid {pid} failed: {err}");
                false
            }
        }
    }

    /// Nudge arrival. `NtTerminateProcess` and `NtTerminateJobObject` can
    /// both deliver one, so only the first arrival exits the process.
    pub fn on_nudge(&self, argument: u64) {
        let nudge_arg = argument & 0xffff_ffff;
        let exit_code = (argument >> 32) as i32;

        if nudge_arg != NUDGE_TERMINATE_PROCESS {
            debug_assert!(false, "unsupported nudge");
            return;
        }

        if self.nudge_exits.fetch_add(1, Ordering::SeqCst) == 0 {
            self.host.exit_process(exit_code);
        }
    }

    fn final_dump(&self) -> Result<()> {
        let mut writer = BufWriter::new(File::create(&self.output_path)?);

        let mut syscalls_writer = if self.opened_files.is_some() {
            let path = PathBuf::from(format!(
                "{}.{SYSCALLS_SUFFIX}",
                self.output_path.display()
            ));
            Some(BufWriter::new(File::create(path)?))
        } else {
            None
        };

        self.dump(
            &mut writer,
            syscalls_writer.as_mut().map(|w| w as &mut dyn Write),
            false,
        )
    }

    fn dump<'a>(
        &self,
        writer: &'a mut dyn Write,
        syscalls_file: Option<&'a mut dyn Write>,
        reset: bool,
    ) -> Result<()> {
        let mut request = DumpRequest {
            dump_file: writer,
            reset,
            syscalls_file,
        };

        let mut symbols_guard = self.symbols.as_ref().map(|m| m.lock().unwrap());
        let symbols = symbols_guard
            .as_deref_mut()
            .map(|s| s as &mut dyn SymbolSource);

        dump::dump_coverage(
            &self.data,
            self.opened_files.as_ref(),
            &self.options,
            symbols,
            &mut request,
        )
    }
}
