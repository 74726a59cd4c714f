//! Tracking of loaded modules and their address ranges.
//!
//! The table answers "which module owns this pc?" on the block-emit hot
//! path. Entries are append-only: an unload only flips a flag, and a module
//! reloaded with an identical descriptor is rebound to its old entry, so a
//! module id stays valid for the life of the process.

use std::fs;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::debug;

use crate::host::ModuleDescriptor;

const GLOBAL_MODULE_CACHE: usize = 8;
const THREAD_MODULE_CACHE: usize = 4;

pub struct ModuleEntry {
    id: u32,
    containing_id: u32,
    start: u64,
    end: u64,
    entry_point: u64,
    checksum: u32,
    timestamp: u32,
    preferred_base: u64,
    name: Option<String>,
    path: String,
    unload: AtomicBool,
}

impl ModuleEntry {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn preferred_base(&self) -> u64 {
        self.preferred_base
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Preferred name, or the path's file name for nameless modules.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| {
            Path::new(&self.path)
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(&self.path)
        })
    }

    /// Whether the entry is live and its range contains `pc`. A stale cache
    /// hit on an unloaded module is rejected here.
    fn contains(&self, pc: u64) -> bool {
        !self.unload.load(Ordering::Acquire) && pc >= self.start && pc < self.end
    }

    fn matches_reload(&self, descriptor: &ModuleDescriptor) -> bool {
        self.start == descriptor.start
            && self.end == descriptor.end
            && self.entry_point == descriptor.entry_point
            && self.checksum == descriptor.checksum
            && self.timestamp == descriptor.timestamp
            // Nameless modules always get fresh entries.
            && self.name.is_some()
            && self.name == descriptor.name
    }
}

/// Per-thread lookup cache, LRU-ordered.
///
/// The host creates one per application thread and passes it into the hot
/// path calls, the same way the thread's instrumentation context travels.
#[derive(Default)]
pub struct ThreadContext {
    cache: [Option<Arc<ModuleEntry>>; THREAD_MODULE_CACHE],
}

impl ThreadContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, entry: Arc<ModuleEntry>) {
        self.cache.rotate_right(1);
        self.cache[0] = Some(entry);
    }
}

pub struct ModuleTable {
    /// All entries ever created, most recent last.
    vector: Mutex<Vec<Arc<ModuleEntry>>>,

    /// Direct-mapped cache indexed by `id % GLOBAL_MODULE_CACHE`. Slots are
    /// atomic cells, so lookups never take the table lock.
    cache: [AtomicPtr<ModuleEntry>; GLOBAL_MODULE_CACHE],

    /// Module names to instrument; empty means everything.
    allowlist: Vec<String>,
}

impl ModuleTable {
    pub fn new(allowlist: Vec<String>) -> Self {
        Self {
            vector: Mutex::new(Vec::new()),
            cache: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            allowlist,
        }
    }

    /// Track a loaded module. Returns false when the allow-list excludes it,
    /// in which case the host should not instrument the module at all.
    pub fn on_module_load(&self, descriptor: &ModuleDescriptor, is_initial: bool) -> bool {
        if !self.should_instrument(descriptor) {
            debug!(
                "not instrumenting {}",
                descriptor.name.as_deref().unwrap_or(&descriptor.path)
            );
            return false;
        }

        let entry = {
            let mut vector = self.vector.lock().unwrap();

            // Some apps repeatedly unload and reload the same module, and
            // reloads cluster near the tail, so scan backwards for a dead
            // entry to rebind.
            let resurrected = vector.iter().rev().find(|entry| {
                entry.id == entry.containing_id
                    && entry.unload.load(Ordering::Acquire)
                    && entry.matches_reload(descriptor)
            });

            match resurrected {
                Some(entry) => {
                    entry.unload.store(false, Ordering::Release);
                    entry.clone()
                }
                None => {
                    let id = vector.len() as u32;
                    let entry = Arc::new(ModuleEntry {
                        id,
                        containing_id: id,
                        start: descriptor.start,
                        end: descriptor.end,
                        entry_point: descriptor.entry_point,
                        checksum: descriptor.checksum,
                        timestamp: descriptor.timestamp,
                        preferred_base: descriptor.preferred_base,
                        name: descriptor.name.clone(),
                        path: descriptor.path.clone(),
                        unload: AtomicBool::new(false),
                    });
                    vector.push(entry.clone());
                    entry
                }
            }
        };

        debug!(
            "module {} loaded as id {} at {:#x}-{:#x} (initial: {is_initial})",
            entry.display_name(),
            entry.id,
            entry.start,
            entry.end
        );
        self.cache_global(&entry);
        true
    }

    /// Mark the module containing `descriptor.start` as unloaded.
    pub fn on_module_unload(&self, descriptor: &ModuleDescriptor) {
        let vector = self.vector.lock().unwrap();

        // Backwards, and main entries only: sub-entries of a non-contiguous
        // module would otherwise shadow their container.
        for entry in vector.iter().rev() {
            if entry.id == entry.containing_id && entry.contains(descriptor.start) {
                entry.unload.store(true, Ordering::Release);
                return;
            }
        }
    }

    /// Resolve `pc` to its owning module, or `None` so the caller skips
    /// instrumentation for that pc.
    pub fn lookup(&self, thread: &mut ThreadContext, pc: u64) -> Option<Arc<ModuleEntry>> {
        // Tier 1: per-thread LRU. Promote hits towards the front.
        for i in 0..THREAD_MODULE_CACHE {
            if let Some(entry) = thread.cache[i].as_ref() {
                if entry.contains(pc) {
                    let entry = entry.clone();
                    if i > 0 {
                        thread.cache[..=i].rotate_right(1);
                    }
                    return Some(entry);
                }
            }
        }

        // Tier 2: global direct-mapped cache, lock-free.
        for slot in &self.cache {
            let ptr = slot.load(Ordering::Acquire);
            if ptr.is_null() {
                continue;
            }

            // Safety: slots only hold pointers obtained from `Arc`s stored
            // in `self.vector`, which is append-only and keeps every entry
            // alive until the table is dropped; `&self` here excludes that
            // drop.
            let entry = unsafe {
                Arc::increment_strong_count(ptr);
                Arc::from_raw(ptr as *const ModuleEntry)
            };

            if entry.contains(pc) {
                thread.insert(entry.clone());
                return Some(entry);
            }
        }

        // Tier 3: full scan under the lock, most recent first.
        let vector = self.vector.lock().unwrap();
        for entry in vector.iter().rev() {
            if entry.contains(pc) {
                let entry = entry.clone();
                self.cache_global(&entry);
                thread.insert(entry.clone());
                return Some(entry);
            }
        }

        None
    }

    fn cache_global(&self, entry: &Arc<ModuleEntry>) {
        let slot = &self.cache[entry.id as usize % GLOBAL_MODULE_CACHE];
        slot.store(Arc::as_ptr(entry) as *mut ModuleEntry, Ordering::Release);
    }

    fn should_instrument(&self, descriptor: &ModuleDescriptor) -> bool {
        if self.allowlist.is_empty() {
            return true;
        }

        match descriptor.name.as_deref() {
            Some(name) => self.allowlist.iter().any(|allowed| allowed == name),
            None => false,
        }
    }
}

/// Read a newline-separated module allow-list.
pub(crate) fn load_allowlist(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)?;

    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn descriptor(name: &str, start: u64, end: u64) -> ModuleDescriptor {
        ModuleDescriptor {
            name: Some(name.to_owned()),
            path: format!("/path/{name}"),
            start,
            end,
            entry_point: start + 0x100,
            checksum: 0xc0ffee,
            timestamp: 0x5eed,
            preferred_base: start,
        }
    }

    #[test]
    fn lookup_hits_and_misses() {
        let table = ModuleTable::new(Vec::new());
        let mut thread = ThreadContext::new();

        assert!(table.on_module_load(&descriptor("app", 0x10000, 0x20000), true));

        let entry = table.lookup(&mut thread, 0x11000).unwrap();
        assert_eq!(entry.id(), 0);
        assert_eq!(entry.display_name(), "app");

        assert!(table.lookup(&mut thread, 0x20000).is_none());
        assert!(table.lookup(&mut thread, 0xffff).is_none());
    }

    #[test]
    fn unload_then_reload_keeps_the_id() {
        let table = ModuleTable::new(Vec::new());
        let mut thread = ThreadContext::new();

        for i in 0..8u64 {
            let d = descriptor(&format!("mod{i}"), 0x1000_0000 * (i + 1), 0x1000_0000 * (i + 1) + 0x1000);
            table.on_module_load(&d, false);
        }

        let target = descriptor("mod6", 0x1000_0000 * 7, 0x1000_0000 * 7 + 0x1000);
        assert_eq!(table.lookup(&mut thread, target.start).unwrap().id(), 6);

        table.on_module_unload(&target);
        let mut fresh = ThreadContext::new();
        assert!(table.lookup(&mut fresh, target.start).is_none());

        // Identical descriptor: the dead entry is rebound in place.
        table.on_module_load(&target, false);
        assert_eq!(table.lookup(&mut fresh, target.start).unwrap().id(), 6);
    }

    #[test]
    fn changed_descriptor_gets_a_fresh_id() {
        let table = ModuleTable::new(Vec::new());
        let mut thread = ThreadContext::new();

        let original = descriptor("app", 0x10000, 0x20000);
        table.on_module_load(&original, true);
        table.on_module_unload(&original);

        let mut moved = original.clone();
        moved.checksum = 0xdead;
        table.on_module_load(&moved, false);

        assert_eq!(table.lookup(&mut thread, 0x11000).unwrap().id(), 1);
    }

    #[test]
    fn stale_thread_cache_rejects_unloaded_module() {
        let table = ModuleTable::new(Vec::new());
        let mut thread = ThreadContext::new();

        let d = descriptor("app", 0x10000, 0x20000);
        table.on_module_load(&d, true);
        assert!(table.lookup(&mut thread, 0x11000).is_some());

        // The cached pointer is still there, but the flag kills the hit.
        table.on_module_unload(&d);
        assert!(table.lookup(&mut thread, 0x11000).is_none());
    }

    #[test]
    fn allowlist_excludes_other_modules() {
        let table = ModuleTable::new(vec!["app".to_owned()]);
        let mut thread = ThreadContext::new();

        assert!(table.on_module_load(&descriptor("app", 0x10000, 0x20000), true));
        assert!(!table.on_module_load(&descriptor("libother.so", 0x30000, 0x40000), false));

        assert!(table.lookup(&mut thread, 0x11000).is_some());
        assert!(table.lookup(&mut thread, 0x31000).is_none());
    }

    #[test]
    fn nameless_module_is_never_resurrected() {
        let table = ModuleTable::new(Vec::new());
        let mut thread = ThreadContext::new();

        let mut d = descriptor("app", 0x10000, 0x20000);
        d.name = None;
        table.on_module_load(&d, true);
        table.on_module_unload(&d);
        table.on_module_load(&d, false);

        assert_eq!(table.lookup(&mut thread, 0x11000).unwrap().id(), 1);
    }

    #[test]
    fn ids_are_monotonic() {
        let table = ModuleTable::new(Vec::new());

        for i in 0..4u64 {
            table.on_module_load(&descriptor(&format!("m{i}"), 0x10000 * (i + 1), 0x10000 * (i + 1) + 0x100), false);
        }

        let mut thread = ThreadContext::new();
        for i in 0..4u64 {
            let entry = table.lookup(&mut thread, 0x10000 * (i + 1)).unwrap();
            assert_eq!(entry.id(), i as u32);
        }
    }
}
