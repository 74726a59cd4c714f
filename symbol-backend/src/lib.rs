//! Debug-symbol lookup behind a capability trait.
//!
//! The offline tools and the engine's symbolic dump mode all consume symbol
//! information through [`SymbolSource`], so the backing store can be the
//! module's own debug info, a pre-extracted symbols file, or an in-memory
//! table in tests.

use std::path::Path;

use anyhow::Result;

pub mod debuginfo;
pub mod extracted;
pub mod fake;

pub use debuginfo::DebugInfoSource;
pub use extracted::ExtractedSymbols;
pub use fake::FakeSymbols;

/// A resolved symbol for a module-relative offset.
///
/// `start` and `end` bound the containing symbol, so a caller can recognize
/// sibling offsets of the same symbol without another query.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SymbolInfo {
    pub name: String,
    pub file: String,
    pub line: u64,
    pub start: u64,
    pub end: u64,
}

impl SymbolInfo {
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset <= self.end
    }
}

/// One source-line record: the module-relative offset of the line's first
/// instruction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LineRecord {
    pub file: String,
    pub line: u64,
    pub offset: u64,
}

/// What kind of debug information a module carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DebugKind {
    None,
    Dwarf,
    Pdb,
    Extracted,
}

/// Capability trait over a debug-info service.
///
/// Construction and drop stand in for backend init/exit. `lookup_address`
/// distinguishes "module loaded, offset unknown" (`Ok(None)`) from "module
/// debug info could not be loaded" (`Err`); callers decide how sticky either
/// failure is.
pub trait SymbolSource {
    fn lookup_address(&mut self, module_path: &Path, offset: u64) -> Result<Option<SymbolInfo>>;

    fn enumerate_lines(
        &mut self,
        module_path: &Path,
        visit: &mut dyn FnMut(&LineRecord),
    ) -> Result<()>;

    fn enumerate_symbols(
        &mut self,
        module_path: &Path,
        visit: &mut dyn FnMut(&SymbolInfo),
    ) -> Result<()>;

    fn module_debug_kind(&mut self, module_path: &Path) -> Result<DebugKind>;
}

impl<S: SymbolSource + ?Sized> SymbolSource for Box<S> {
    fn lookup_address(&mut self, module_path: &Path, offset: u64) -> Result<Option<SymbolInfo>> {
        (**self).lookup_address(module_path, offset)
    }

    fn enumerate_lines(
        &mut self,
        module_path: &Path,
        visit: &mut dyn FnMut(&LineRecord),
    ) -> Result<()> {
        (**self).enumerate_lines(module_path, visit)
    }

    fn enumerate_symbols(
        &mut self,
        module_path: &Path,
        visit: &mut dyn FnMut(&SymbolInfo),
    ) -> Result<()> {
        (**self).enumerate_symbols(module_path, visit)
    }

    fn module_debug_kind(&mut self, module_path: &Path) -> Result<DebugKind> {
        (**self).module_debug_kind(module_path)
    }
}
