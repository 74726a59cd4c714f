//! Capture of file-open syscalls.

use std::path::Path;
use std::sync::Mutex;

use crate::host::{OpenSyscalls, SyscallView};

/// Captured paths are bounded; anything longer is cut at a char boundary.
const MAX_CAPTURED_PATH: usize = 512;

/// The ordered sequence of files the application opened since the last
/// reset.
pub(crate) struct OpenedFiles {
    sysnums: OpenSyscalls,
    paths: Mutex<Vec<String>>,
}

impl OpenedFiles {
    pub fn new(sysnums: OpenSyscalls) -> Self {
        Self {
            sysnums,
            paths: Mutex::new(Vec::new()),
        }
    }

    pub fn is_traced(&self, sysnum: i32) -> bool {
        sysnum == self.sysnums.open || Some(sysnum) == self.sysnums.openat
    }

    pub fn capture(&self, syscall: &dyn SyscallView) {
        let sysnum = syscall.sysnum();

        let index = if Some(sysnum) == self.sysnums.openat {
            1
        } else if sysnum == self.sysnums.open {
            0
        } else {
            return;
        };

        let Some(mut path) = syscall.path_param(index) else {
            return;
        };
        truncate_path(&mut path);

        if keep_path(&path) {
            self.paths.lock().unwrap().push(path);
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }

    pub fn reset(&self) {
        *self.paths.lock().unwrap() = Vec::new();
    }
}

fn truncate_path(path: &mut String) {
    if path.len() <= MAX_CAPTURED_PATH {
        return;
    }

    let mut cut = MAX_CAPTURED_PATH;
    while !path.is_char_boundary(cut) {
        cut -= 1;
    }
    path.truncate(cut);
}

/// Only actual files are interesting, and log files generated by the run
/// itself are not.
fn keep_path(path: &str) -> bool {
    !path.contains(".log") && Path::new(path).extension().is_some()
}
