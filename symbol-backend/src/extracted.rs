//! Symbol lookups backed by pre-extracted `.binaryrts` files.
//!
//! An extracted-symbols file sits next to its module
//! (`<module-basename>.binaryrts`) and holds one symbolic record line per
//! known block offset. Records carry no symbol bounds, so lookups match
//! exact offsets only.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use dump_format::{parse, SymbolRecord, EXTRACTED_SYMBOLS_EXT};
use log::warn;

use crate::{DebugKind, LineRecord, SymbolInfo, SymbolSource};

/// Path of the extracted-symbols file for a module.
pub fn symbols_file_path(module_path: &Path) -> PathBuf {
    module_path.with_extension(EXTRACTED_SYMBOLS_EXT)
}

/// Read all records from an extracted-symbols file. Malformed lines are
/// skipped with a warning.
pub fn read_symbols_file(path: &Path) -> Result<Vec<SymbolRecord>> {
    let text = fs::read_to_string(path)?;

    let mut records = Vec::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        match parse::symbol_line(line) {
            Ok(record) => records.push(record),
            Err(err) => warn!("skipping bad record in {}: {err}", path.display()),
        }
    }

    Ok(records)
}

#[derive(Default)]
pub struct ExtractedSymbols {
    // `None` caches "no symbols file for this module".
    modules: HashMap<PathBuf, Option<BTreeMap<u64, SymbolRecord>>>,
}

impl ExtractedSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    fn fetch(&mut self, module: &Path) -> Option<&BTreeMap<u64, SymbolRecord>> {
        if !self.modules.contains_key(module) {
            let symbols_file = symbols_file_path(module);
            let loaded = match read_symbols_file(&symbols_file) {
                Ok(records) => Some(
                    records
                        .into_iter()
                        .map(|record| (record.offset, record))
                        .collect(),
                ),
                Err(err) => {
                    warn!(
                        "could not load symbols file {}: {err}",
                        symbols_file.display()
                    );
                    None
                }
            };
            self.modules.insert(module.to_owned(), loaded);
        }

        self.modules.get(module).and_then(|table| table.as_ref())
    }
}

impl SymbolSource for ExtractedSymbols {
    fn lookup_address(&mut self, module_path: &Path, offset: u64) -> Result<Option<SymbolInfo>> {
        let Some(table) = self.fetch(module_path) else {
            return Ok(None);
        };

        Ok(table.get(&offset).map(|record| SymbolInfo {
            name: record.name.clone(),
            file: record.file.clone(),
            line: record.line,
            start: offset,
            end: offset,
        }))
    }

    fn enumerate_lines(
        &mut self,
        module_path: &Path,
        visit: &mut dyn FnMut(&LineRecord),
    ) -> Result<()> {
        let Some(table) = self.fetch(module_path) else {
            anyhow::bail!("no symbols file for {}", module_path.display());
        };

        for record in table.values() {
            visit(&LineRecord {
                file: record.file.clone(),
                line: record.line,
                offset: record.offset,
            });
        }

        Ok(())
    }

    fn enumerate_symbols(
        &mut self,
        module_path: &Path,
        visit: &mut dyn FnMut(&SymbolInfo),
    ) -> Result<()> {
        let Some(table) = self.fetch(module_path) else {
            anyhow::bail!("no symbols file for {}", module_path.display());
        };

        for record in table.values() {
            visit(&SymbolInfo {
                name: record.name.clone(),
                file: record.file.clone(),
                line: record.line,
                start: record.offset,
                end: record.offset,
            });
        }

        Ok(())
    }

    fn module_debug_kind(&mut self, module_path: &Path) -> Result<DebugKind> {
        Ok(if self.fetch(module_path).is_some() {
            DebugKind::Extracted
        } else {
            DebugKind::None
        })
    }
}
