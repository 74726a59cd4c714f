//! The multi-tier symbol cache.
//!
//! Entries live in an arena and are addressed by id, so the two
//! most-recently-used shortcut slots can point at entries without fighting
//! the borrow of the per-module maps.

use std::collections::HashMap;
use std::path::Path;

use log::error;
use symbol_backend::extracted;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SymbolStatus {
    Unresolved,
    NotFound,
    Excluded,
    Resolved,
}

/// A cached resolution for one (module, offset) pair.
///
/// The status only ever moves away from `Unresolved`; the three terminal
/// states are sticky, so a backend is consulted at most once per offset.
#[derive(Clone, Debug)]
pub struct CoveredSymbol {
    pub name: String,
    pub file: String,
    pub line: u64,
    pub offset: u64,
    pub start: u64,
    pub end: u64,
    pub status: SymbolStatus,
}

impl CoveredSymbol {
    fn unresolved(offset: u64) -> Self {
        Self {
            name: String::new(),
            file: String::new(),
            line: 0,
            offset,
            start: 0,
            end: 0,
            status: SymbolStatus::Unresolved,
        }
    }

    pub fn is_same_symbol(&self, offset: u64) -> bool {
        offset >= self.start && offset <= self.end
    }

    pub fn is_same_line(&self, other: &CoveredSymbol) -> bool {
        self.line == other.line && self.file == other.file
    }
}

pub type SymbolId = usize;

#[derive(Default)]
pub struct SymbolCache {
    // Module name -> offset -> entry id.
    modules: HashMap<String, HashMap<u64, SymbolId>>,
    symbols: Vec<CoveredSymbol>,

    // Single-slot MRU shortcuts.
    last_module: Option<String>,
    last_symbol: Option<(u64, SymbolId)>,
}

impl SymbolCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: SymbolId) -> &CoveredSymbol {
        &self.symbols[id]
    }

    pub(crate) fn get_mut(&mut self, id: SymbolId) -> &mut CoveredSymbol {
        &mut self.symbols[id]
    }

    pub fn has_module(&self, module_name: &str) -> bool {
        self.modules.contains_key(module_name)
    }

    /// Find or create the entry for `(module_name, offset)`.
    ///
    /// When the previous query hit a different offset of the same symbol,
    /// the new entry is filled from it without touching the backend.
    pub fn find_symbol(&mut self, module_name: &str, offset: u64) -> SymbolId {
        let mut same_as_last = false;

        if self.last_module.as_deref() == Some(module_name) {
            if let Some((last_offset, last_id)) = self.last_symbol {
                if last_offset == offset {
                    return last_id;
                }
                if self.symbols[last_id].is_same_symbol(offset) {
                    same_as_last = true;
                }
            }
        }

        if let Some(&id) = self
            .modules
            .get(module_name)
            .and_then(|map| map.get(&offset))
        {
            return id;
        }

        let id = self.symbols.len();
        let symbol = if same_as_last {
            let last = &self.symbols[self.last_symbol.expect("same as last").1];
            CoveredSymbol {
                offset,
                name: last.name.clone(),
                file: last.file.clone(),
                line: last.line,
                start: last.start,
                end: last.end,
                status: last.status,
            }
        } else {
            CoveredSymbol::unresolved(offset)
        };
        self.symbols.push(symbol);
        self.modules
            .entry(module_name.to_owned())
            .or_default()
            .insert(offset, id);

        if !same_as_last {
            self.last_module = Some(module_name.to_owned());
            self.last_symbol = Some((offset, id));
        }

        id
    }

    /// Seed the module's map from its `.binaryrts` file. The module map is
    /// created even when the file is missing, so the load runs only once.
    pub fn load_extracted(&mut self, module_name: &str, module_path: &Path) {
        self.modules.entry(module_name.to_owned()).or_default();

        let symbols_file = extracted::symbols_file_path(module_path);
        let records = match extracted::read_symbols_file(&symbols_file) {
            Ok(records) => records,
            Err(err) => {
                error!(
                    "could not locate symbols file at {}: {err}",
                    symbols_file.display()
                );
                return;
            }
        };

        for record in records {
            let map = self.modules.get_mut(module_name).expect("just created");
            if map.contains_key(&record.offset) {
                continue;
            }

            let id = self.symbols.len();
            self.symbols.push(CoveredSymbol {
                name: record.name,
                file: record.file,
                line: record.line,
                offset: record.offset,
                start: record.offset,
                end: record.offset,
                status: SymbolStatus::Resolved,
            });
            map.insert(record.offset, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn same_offset_hits_the_shortcut_slot() {
        let mut cache = SymbolCache::new();

        let id = cache.find_symbol("app", 0x1000);
        assert_eq!(cache.find_symbol("app", 0x1000), id);
        assert_eq!(cache.get(id).status, SymbolStatus::Unresolved);
    }

    #[test]
    fn sibling_offset_copies_the_last_resolution() {
        let mut cache = SymbolCache::new();

        let id = cache.find_symbol("app", 0x1000);
        {
            let symbol = cache.get_mut(id);
            symbol.name = "foo()".into();
            symbol.file = "/src/foo.cpp".into();
            symbol.line = 42;
            symbol.start = 0x1000;
            symbol.end = 0x103f;
            symbol.status = SymbolStatus::Resolved;
        }

        let sibling = cache.find_symbol("app", 0x1010);
        assert_ne!(sibling, id);
        assert_eq!(cache.get(sibling).status, SymbolStatus::Resolved);
        assert_eq!(cache.get(sibling).line, 42);
        assert_eq!(cache.get(sibling).offset, 0x1010);
    }

    #[test]
    fn other_module_does_not_shortcut() {
        let mut cache = SymbolCache::new();

        let id = cache.find_symbol("app", 0x1000);
        cache.get_mut(id).start = 0x1000;
        cache.get_mut(id).end = 0x2000;
        cache.get_mut(id).status = SymbolStatus::Resolved;

        let other = cache.find_symbol("libfoo.so", 0x1010);
        assert_eq!(cache.get(other).status, SymbolStatus::Unresolved);
    }

    #[test]
    fn extracted_symbols_resolve_exact_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let module_path = dir.path().join("app.exe");
        std::fs::write(
            dir.path().join("app.binaryrts"),
            "\t+0x1000\t/src/foo.cpp\tfoo()\t42\n",
        )
        .unwrap();

        let mut cache = SymbolCache::new();
        cache.load_extracted("app.exe", &module_path);
        assert!(cache.has_module("app.exe"));

        let id = cache.find_symbol("app.exe", 0x1000);
        assert_eq!(cache.get(id).status, SymbolStatus::Resolved);
        assert_eq!(cache.get(id).name, "foo()");

        let miss = cache.find_symbol("app.exe", 0x9999);
        assert_eq!(cache.get(miss).status, SymbolStatus::Unresolved);
    }
}
