//! Per-module line caches.
//!
//! A module's enumerated line starts live in two parallel structures: an
//! offset-keyed map for O(1) resolution and an ordered offset set for
//! predecessor/successor queries on offsets that fall inside a line.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use symbol_backend::SymbolSource;

/// One source line known to start at `offset`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CoveredLine {
    pub file: String,
    pub line: u64,
    pub offset: u64,
}

#[derive(Default)]
pub struct LineCache {
    lines: HashMap<String, HashMap<u64, CoveredLine>>,
    offsets: HashMap<String, BTreeSet<u64>>,

    // Block start offsets already processed, per module.
    recorded: HashMap<String, HashSet<u64>>,
}

impl LineCache {
    pub fn has_module(&self, module: &str) -> bool {
        self.lines.contains_key(module)
    }

    pub fn add_line(&mut self, module: &str, line: CoveredLine) {
        let map = self.lines.entry(module.to_owned()).or_default();
        if map.contains_key(&line.offset) {
            return;
        }

        self.offsets
            .entry(module.to_owned())
            .or_default()
            .insert(line.offset);
        map.insert(line.offset, line);
    }

    pub fn has_recorded_bb(&self, module: &str, offset: u64) -> bool {
        self.recorded
            .get(module)
            .map_or(false, |set| set.contains(&offset))
    }

    pub fn record_bb(&mut self, module: &str, offset: u64) {
        self.recorded
            .entry(module.to_owned())
            .or_default()
            .insert(offset);
    }

    /// Resolve an offset to its source line.
    ///
    /// A line-start offset is a direct map hit. An interior offset is
    /// resolved either by asking the backend again (`accurate`), or from the
    /// nearest recorded line starts on both sides: when predecessor and
    /// successor belong to the same source line the offset does too,
    /// otherwise the block straddles a line boundary ambiguously and stays
    /// unresolved.
    pub fn find_line<S: SymbolSource>(
        &mut self,
        module: &str,
        offset: u64,
        source: &mut S,
        accurate: bool,
    ) -> Option<CoveredLine> {
        if let Some(line) = self.lines.get(module).and_then(|map| map.get(&offset)) {
            return Some(line.clone());
        }

        if accurate {
            let info = source.lookup_address(Path::new(module), offset).ok()??;

            let line = CoveredLine {
                file: info.file,
                line: info.line,
                offset,
            };
            self.add_line(module, line.clone());
            return Some(line);
        }

        let offsets = self.offsets.get(module)?;
        let successor = *offsets.range(offset + 1..).next()?;
        let predecessor = *offsets.range(..=offset).next_back()?;

        let map = self.lines.get(module)?;
        let preceding = map.get(&predecessor)?.clone();
        let succeeding = map.get(&successor)?;
        if preceding.line != succeeding.line {
            return None;
        }

        let line = CoveredLine {
            file: preceding.file,
            line: preceding.line,
            offset,
        };
        self.add_line(module, line.clone());
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use symbol_backend::FakeSymbols;

    use super::*;

    fn cache_with_lines(lines: &[(u64, u64)]) -> LineCache {
        let mut cache = LineCache::default();
        for &(offset, line) in lines {
            cache.add_line(
                "/path/app",
                CoveredLine {
                    file: "/src/foo.cpp".into(),
                    line,
                    offset,
                },
            );
        }
        cache
    }

    #[test]
    fn line_start_is_a_direct_hit() {
        let mut cache = cache_with_lines(&[(0x100, 10), (0x110, 11)]);
        let mut source = FakeSymbols::new();

        let hit = cache
            .find_line("/path/app", 0x100, &mut source, false)
            .unwrap();
        assert_eq!(hit.line, 10);
        assert_eq!(source.lookups(), 0);
    }

    #[test]
    fn interior_offset_between_same_line_starts() {
        let mut cache = cache_with_lines(&[(0x100, 10), (0x110, 10), (0x120, 11)]);
        let mut source = FakeSymbols::new();

        let hit = cache
            .find_line("/path/app", 0x104, &mut source, false)
            .unwrap();
        assert_eq!(hit.line, 10);

        // The resolved offset joins the set for future queries.
        let again = cache
            .find_line("/path/app", 0x104, &mut source, false)
            .unwrap();
        assert_eq!(again.line, 10);
    }

    #[test]
    fn straddling_offset_stays_unresolved() {
        let mut cache = cache_with_lines(&[(0x100, 10), (0x110, 11)]);
        let mut source = FakeSymbols::new();

        assert_eq!(cache.find_line("/path/app", 0x108, &mut source, false), None);
    }

    #[test]
    fn offsets_outside_the_enumerated_range_stay_unresolved() {
        let mut cache = cache_with_lines(&[(0x100, 10), (0x110, 10)]);
        let mut source = FakeSymbols::new();

        // No successor.
        assert_eq!(cache.find_line("/path/app", 0x200, &mut source, false), None);
        // No predecessor.
        assert_eq!(cache.find_line("/path/app", 0x80, &mut source, false), None);
    }
}
