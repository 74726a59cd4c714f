//! The per-module basic-block table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::modules::ModuleEntry;

/// One observed basic block of a covered module.
///
/// `data` is the hit count by default, or the block size in bytes when the
/// engine records sizes. Hit counts are incremented racily from application
/// threads and reset from the dumping thread; both sides tolerate lost
/// updates.
pub struct BlockEntry {
    offset: u32,
    data: AtomicU32,
}

impl BlockEntry {
    fn new(offset: u32) -> Self {
        Self {
            offset,
            data: AtomicU32::new(0),
        }
    }

    /// Offset of the block within its module segment.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Racy hit-count increment.
    ///
    /// Deliberately not a read-modify-write: concurrent increments may lose
    /// updates and the counter may wrap, both of which are acceptable since
    /// any nonzero value marks the block as covered.
    pub fn hit(&self) {
        let value = self.data.load(Ordering::Relaxed);
        self.data.store(value.wrapping_add(1), Ordering::Relaxed);
    }

    pub(crate) fn record(&self, value: u32) {
        self.data.store(value, Ordering::Relaxed);
    }

    pub(crate) fn value(&self) -> u32 {
        self.data.load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self) {
        self.data.store(0, Ordering::Relaxed);
    }
}

/// A module with at least one observed block. Created lazily on the first
/// block emitted inside the module.
pub(crate) struct CoveredModule {
    pub mod_id: u32,
    pub name: String,
    pub path: String,
    blocks: Mutex<HashMap<u32, Arc<BlockEntry>>>,
}

impl CoveredModule {
    fn new(mod_id: u32, name: String, path: String) -> Self {
        Self {
            mod_id,
            name,
            path,
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Insert the block at `offset`, returning the entry and whether it is
    /// new. An offset appears at most once per module.
    pub fn insert_block(&self, offset: u32) -> (Arc<BlockEntry>, bool) {
        let mut blocks = self.blocks.lock().unwrap();

        if let Some(entry) = blocks.get(&offset) {
            return (entry.clone(), false);
        }

        let entry = Arc::new(BlockEntry::new(offset));
        blocks.insert(offset, entry.clone());
        (entry, true)
    }

    /// All block entries, ordered by offset.
    pub fn snapshot(&self) -> Vec<Arc<BlockEntry>> {
        let blocks = self.blocks.lock().unwrap();

        let mut entries: Vec<_> = blocks.values().cloned().collect();
        entries.sort_by_key(|entry| entry.offset());
        entries
    }
}

/// The live coverage map: covered modules in first-seen order.
pub(crate) struct CoverageData {
    covered_modules: Mutex<Vec<Arc<CoveredModule>>>,
}

impl CoverageData {
    pub fn new() -> Self {
        Self {
            covered_modules: Mutex::new(Vec::new()),
        }
    }

    pub fn insert_block(&self, module: &ModuleEntry, offset: u32) -> (Arc<BlockEntry>, bool) {
        let covered = {
            let mut modules = self.covered_modules.lock().unwrap();

            match modules.iter().find(|m| m.mod_id == module.id()) {
                Some(covered) => covered.clone(),
                None => {
                    let covered = Arc::new(CoveredModule::new(
                        module.id(),
                        module.display_name().to_owned(),
                        module.path().to_owned(),
                    ));
                    modules.push(covered.clone());
                    covered
                }
            }
        };

        covered.insert_block(offset)
    }

    pub fn modules(&self) -> Vec<Arc<CoveredModule>> {
        self.covered_modules.lock().unwrap().clone()
    }
}
