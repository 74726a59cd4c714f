//! Symbol lookups backed by the module's own debug info.
//!
//! On first access to a module, its object file is parsed and the debug
//! session is drained into two ordered maps: function entry points and
//! source-line starts. All later queries are answered from those maps.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use log::debug;
use symbolic::debuginfo::{FileFormat, Object};
use symbolic::demangle::{Demangle, DemangleOptions};

use crate::{DebugKind, LineRecord, SymbolInfo, SymbolSource};

/// Caching provider of symbol information for executable modules.
#[derive(Default)]
pub struct DebugInfoSource {
    // Cached per-module tables, keyed by module path.
    modules: HashMap<PathBuf, ModuleDebugInfo>,

    // Set of module paths known to lack debug info.
    no_debug_info: HashSet<PathBuf>,
}

struct ModuleDebugInfo {
    kind: DebugKind,
    functions: BTreeMap<u64, FunctionRecord>,
    lines: BTreeMap<u64, SourceLine>,
}

struct FunctionRecord {
    name: String,
    size: u64,
}

struct SourceLine {
    file: String,
    line: u64,
}

impl DebugInfoSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn fetch(&mut self, module: &Path) -> Result<Option<&ModuleDebugInfo>> {
        if self.no_debug_info.contains(module) {
            return Ok(None);
        }

        if !self.modules.contains_key(module) {
            match ModuleDebugInfo::load(module)? {
                Some(info) => {
                    self.modules.insert(module.to_owned(), info);
                }
                None => {
                    self.no_debug_info.insert(module.to_owned());
                    return Ok(None);
                }
            }
        }

        Ok(self.modules.get(module))
    }
}

impl ModuleDebugInfo {
    fn load(module: &Path) -> Result<Option<Self>> {
        let data = fs::read(module)?;
        let object = Object::parse(&data)?;

        if !object.has_debug_info() {
            return Ok(None);
        }

        let kind = match object.file_format() {
            FileFormat::Pe | FileFormat::Pdb => DebugKind::Pdb,
            _ => DebugKind::Dwarf,
        };

        let session = object.debug_session()?;
        let opts = DemangleOptions::complete();

        let mut functions = BTreeMap::new();
        let mut lines = BTreeMap::new();

        for function in session.functions() {
            let function = function?;

            let name = function.name.try_demangle(opts).into_owned();

            for line in &function.lines {
                lines.insert(
                    line.address,
                    SourceLine {
                        file: line.file.path_str(),
                        line: line.line,
                    },
                );
            }

            functions.insert(
                function.address,
                FunctionRecord {
                    name,
                    size: function.size,
                },
            );
        }

        debug!(
            "loaded {} functions, {} line records from {}",
            functions.len(),
            lines.len(),
            module.display()
        );

        Ok(Some(Self {
            kind,
            functions,
            lines,
        }))
    }

    fn find_function(&self, offset: u64) -> Option<(u64, &FunctionRecord)> {
        // Search backwards from the first function whose entry point is at
        // or below `offset`.
        for (start, function) in self.functions.range(..=offset).rev() {
            if offset < start.saturating_add(function.size) {
                return Some((*start, function));
            }
        }

        None
    }
}

impl SymbolSource for DebugInfoSource {
    fn lookup_address(&mut self, module_path: &Path, offset: u64) -> Result<Option<SymbolInfo>> {
        let Some(info) = self.fetch(module_path)? else {
            return Ok(None);
        };

        let Some((function_start, function)) = info.find_function(offset) else {
            return Ok(None);
        };

        let function_end = function_start.saturating_add(function.size);

        // The reported bounds are those of the line region containing the
        // offset, so callers can recognize same-line neighbours without
        // another query while offsets on a different line of the same
        // function still resolve on their own.
        let (start, file, line) = info
            .lines
            .range(function_start..=offset)
            .next_back()
            .map(|(addr, source)| (*addr, source.file.clone(), source.line))
            .unwrap_or((function_start, String::new(), 0));

        let end = info
            .lines
            .range(offset + 1..function_end)
            .next()
            .map(|(addr, _)| addr - 1)
            .unwrap_or_else(|| function_end.saturating_sub(1));

        Ok(Some(SymbolInfo {
            name: function.name.clone(),
            file,
            line,
            start,
            end,
        }))
    }

    fn enumerate_lines(
        &mut self,
        module_path: &Path,
        visit: &mut dyn FnMut(&LineRecord),
    ) -> Result<()> {
        let Some(info) = self.fetch(module_path)? else {
            return Err(anyhow!("no debug info for {}", module_path.display()));
        };

        for (offset, source) in &info.lines {
            visit(&LineRecord {
                file: source.file.clone(),
                line: source.line,
                offset: *offset,
            });
        }

        Ok(())
    }

    fn enumerate_symbols(
        &mut self,
        module_path: &Path,
        visit: &mut dyn FnMut(&SymbolInfo),
    ) -> Result<()> {
        let Some(info) = self.fetch(module_path)? else {
            return Err(anyhow!("no debug info for {}", module_path.display()));
        };

        for (start, function) in &info.functions {
            let end = start.saturating_add(function.size);
            let (file, line) = info
                .lines
                .range(*start..=end)
                .next()
                .map(|(_, source)| (source.file.clone(), source.line))
                .unwrap_or_default();

            visit(&SymbolInfo {
                name: function.name.clone(),
                file,
                line,
                start: *start,
                end,
            });
        }

        Ok(())
    }

    fn module_debug_kind(&mut self, module_path: &Path) -> Result<DebugKind> {
        Ok(self
            .fetch(module_path)?
            .map(|info| info.kind)
            .unwrap_or(DebugKind::None))
    }
}
