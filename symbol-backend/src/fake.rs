//! In-memory symbol tables for tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::{DebugKind, LineRecord, SymbolInfo, SymbolSource};

/// A [`SymbolSource`] over fixed tables, counting backend queries so tests
/// can assert cache behavior.
#[derive(Default)]
pub struct FakeSymbols {
    symbols: HashMap<PathBuf, Vec<SymbolInfo>>,
    lines: HashMap<PathBuf, Vec<LineRecord>>,
    lookups: usize,
}

impl FakeSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbol(mut self, module: impl Into<PathBuf>, info: SymbolInfo) -> Self {
        self.symbols.entry(module.into()).or_default().push(info);
        self
    }

    pub fn line(mut self, module: impl Into<PathBuf>, record: LineRecord) -> Self {
        self.lines.entry(module.into()).or_default().push(record);
        self
    }

    /// Number of `lookup_address` calls served so far.
    pub fn lookups(&self) -> usize {
        self.lookups
    }
}

impl SymbolSource for FakeSymbols {
    fn lookup_address(&mut self, module_path: &Path, offset: u64) -> Result<Option<SymbolInfo>> {
        self.lookups += 1;

        Ok(self
            .symbols
            .get(module_path)
            .and_then(|symbols| symbols.iter().find(|info| info.contains(offset)))
            .cloned())
    }

    fn enumerate_lines(
        &mut self,
        module_path: &Path,
        visit: &mut dyn FnMut(&LineRecord),
    ) -> Result<()> {
        let Some(lines) = self.lines.get(module_path) else {
            anyhow::bail!("no line records for {}", module_path.display());
        };

        for record in lines {
            visit(record);
        }

        Ok(())
    }

    fn enumerate_symbols(
        &mut self,
        module_path: &Path,
        visit: &mut dyn FnMut(&SymbolInfo),
    ) -> Result<()> {
        let Some(symbols) = self.symbols.get(module_path) else {
            anyhow::bail!("no symbols for {}", module_path.display());
        };

        for info in symbols {
            visit(info);
        }

        Ok(())
    }

    fn module_debug_kind(&mut self, module_path: &Path) -> Result<DebugKind> {
        Ok(
            if self.symbols.contains_key(module_path) || self.lines.contains_key(module_path) {
                DebugKind::Dwarf
            } else {
                DebugKind::None
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn lookup_within_symbol_bounds() -> Result<()> {
        let mut fake = FakeSymbols::new().symbol(
            "/path/app",
            SymbolInfo {
                name: "foo()".into(),
                file: "/src/foo.cpp".into(),
                line: 42,
                start: 0x1000,
                end: 0x1040,
            },
        );

        let hit = fake.lookup_address(Path::new("/path/app"), 0x1020)?.unwrap();
        assert_eq!(hit.name, "foo()");

        assert_eq!(fake.lookup_address(Path::new("/path/app"), 0x2000)?, None);
        assert_eq!(fake.lookups(), 2);

        let mut names = Vec::new();
        fake.enumerate_symbols(Path::new("/path/app"), &mut |info| {
            names.push(info.name.clone())
        })?;
        assert_eq!(names, vec!["foo()".to_owned()]);

        Ok(())
    }
}
