//! Offline symbol resolution of coverage dumps.
//!
//! Walks a tree of per-test dump files, resolves every recorded block offset
//! to (file, function, line) through the symbol cache, and rewrites each
//! dump in place as a symbolic record. Rewriting is idempotent: a symbolic
//! file run through the resolver again produces itself.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use dump_format::{write, DumpEvent, DumpReader, SymbolRecord, DUMP_LOOKUP_FILE, FINAL_DUMP_FILE};
use log::{debug, info, warn};
use regex::Regex;
use symbol_backend::SymbolSource;
use walkdir::WalkDir;

pub mod cache;

use cache::{SymbolCache, SymbolId, SymbolStatus};

#[derive(Clone, Debug)]
pub struct ResolverOptions {
    /// Root directory to walk for dump files.
    pub root: PathBuf,

    /// Extension of dump files, including the dot.
    pub ext: String,

    /// Keep only symbols whose source file matches this pattern.
    pub source_regex: Option<String>,

    /// Use pre-extracted `.binaryrts` symbols instead of querying the
    /// backend.
    pub use_extracted: bool,
}

impl ResolverOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ext: dump_format::DEFAULT_DUMP_EXT.to_owned(),
            source_regex: None,
            use_extracted: false,
        }
    }
}

/// Per-module collection of resolved symbols for one dump file, deduplicated
/// on the fly.
pub struct ModuleCoverage {
    pub name: String,
    pub path: String,
    symbols: Vec<SymbolId>,
    last: Option<SymbolId>,
}

impl ModuleCoverage {
    fn new(path: String) -> Self {
        let name = Path::new(&path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());

        Self {
            name,
            path,
            symbols: Vec::new(),
            last: None,
        }
    }

    pub fn symbols(&self) -> &[SymbolId] {
        &self.symbols
    }

    /// Add a resolved symbol unless it duplicates the previously added one
    /// or any earlier symbol of this module.
    fn add_symbol(&mut self, cache: &SymbolCache, id: SymbolId) -> bool {
        let symbol = cache.get(id);

        let same_as_last = self.last.map_or(false, |last| {
            let last = cache.get(last);
            last.is_same_symbol(symbol.offset) || last.is_same_line(symbol)
        });
        self.last = Some(id);
        if same_as_last {
            return false;
        }

        let duplicate = self.symbols.iter().any(|&added| {
            let added = cache.get(added);
            added.is_same_symbol(symbol.offset) || added.is_same_line(symbol)
        });
        if duplicate {
            return false;
        }

        self.symbols.push(id);
        true
    }
}

pub struct SymbolResolver<S> {
    options: ResolverOptions,
    regex: Option<Regex>,
    cache: SymbolCache,
    source: S,

    // Observability: backend queries vs. cache hits.
    query_count: usize,
    match_count: usize,
}

impl<S: SymbolSource> SymbolResolver<S> {
    pub fn new(options: ResolverOptions, source: S) -> Result<Self> {
        let regex = options
            .source_regex
            .as_deref()
            .map(Regex::new)
            .transpose()?;

        Ok(Self {
            options,
            regex,
            cache: SymbolCache::new(),
            source,
            query_count: 0,
            match_count: 0,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        let started = Instant::now();

        self.walk_coverage_files()?;

        info!("took {}ms to finish", started.elapsed().as_millis());
        debug!(
            "symbol counters at query={}, cache-hit={}",
            self.query_count, self.match_count
        );
        Ok(())
    }

    fn walk_coverage_files(&mut self) -> Result<()> {
        debug!(
            "searching for coverage files with extension {} in {}",
            self.options.ext,
            self.options.root.display()
        );

        for entry in WalkDir::new(&self.options.root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            if name == DUMP_LOOKUP_FILE || name == FINAL_DUMP_FILE {
                continue;
            }
            if !matches_ext(entry.path(), &self.options.ext) {
                continue;
            }

            // One bad dump must not stop the batch.
            if let Err(err) = self.analyze_coverage_file(entry.path()) {
                warn!("skipping {}: {err}", entry.path().display());
            }
        }

        Ok(())
    }

    /// Resolve one dump file and rewrite it in place symbolically.
    pub fn analyze_coverage_file(&mut self, file: &Path) -> Result<()> {
        debug!("analyzing coverage file {}", file.display());

        let reader = DumpReader::new(BufReader::new(File::open(file)?));
        let mut coverage: Vec<ModuleCoverage> = Vec::new();

        for event in reader {
            match event? {
                DumpEvent::Module { path, .. } => {
                    coverage.push(ModuleCoverage::new(path));
                }
                DumpEvent::Block { offset, .. } => self.record_offset(&mut coverage, offset),
                DumpEvent::Symbol(record) => self.record_offset(&mut coverage, record.offset),
                DumpEvent::Offsets(offsets) => {
                    for offset in offsets {
                        self.record_offset(&mut coverage, offset);
                    }
                }
            }
        }

        self.rewrite(file, &coverage)
    }

    fn record_offset(&mut self, coverage: &mut [ModuleCoverage], offset: u64) {
        let Some(module) = coverage.last_mut() else {
            return;
        };

        let name = module.name.clone();
        let path = module.path.clone();
        if let Some(id) = self.find_symbol(&name, &path, offset) {
            module.add_symbol(&self.cache, id);
        }
    }

    /// Resolve `(module, offset)` through the cache, consulting the backend
    /// only for offsets never seen before.
    pub fn find_symbol(
        &mut self,
        module_name: &str,
        module_path: &str,
        offset: u64,
    ) -> Option<SymbolId> {
        if self.options.use_extracted && !self.cache.has_module(module_name) {
            self.cache
                .load_extracted(module_name, Path::new(module_path));
        }

        let id = self.cache.find_symbol(module_name, offset);

        match self.cache.get(id).status {
            SymbolStatus::Resolved => {
                self.match_count += 1;
                Some(id)
            }
            SymbolStatus::NotFound | SymbolStatus::Excluded => {
                self.match_count += 1;
                None
            }
            SymbolStatus::Unresolved => {
                if self.options.use_extracted {
                    debug!("symbol not found +{offset:#x} in {module_path}");
                    self.cache.get_mut(id).status = SymbolStatus::NotFound;
                    return None;
                }

                self.query_count += 1;
                match self.source.lookup_address(Path::new(module_path), offset) {
                    Ok(Some(info)) => {
                        let excluded = self
                            .regex
                            .as_ref()
                            .map_or(false, |regex| !regex.is_match(&info.file));

                        let symbol = self.cache.get_mut(id);
                        symbol.name = info.name;
                        symbol.file = info.file;
                        symbol.line = info.line;
                        symbol.start = info.start;
                        symbol.end = info.end;
                        symbol.status = if excluded {
                            SymbolStatus::Excluded
                        } else {
                            SymbolStatus::Resolved
                        };

                        // Seed the bounds into the cache so future offsets
                        // inside this symbol take the shortcut slot.
                        self.cache.find_symbol(module_name, info.start);
                        self.cache.find_symbol(module_name, info.end);
                    }
                    Ok(None) => {
                        debug!("symbol not found +{offset:#x} in {module_path}");
                        self.cache.get_mut(id).status = SymbolStatus::NotFound;
                    }
                    Err(err) => {
                        debug!("symbol load failed for +{offset:#x} in {module_path}: {err}");
                        self.cache.get_mut(id).status = SymbolStatus::NotFound;
                    }
                }

                (self.cache.get(id).status == SymbolStatus::Resolved).then_some(id)
            }
        }
    }

    fn rewrite(&self, file: &Path, coverage: &[ModuleCoverage]) -> Result<()> {
        let mut writer = BufWriter::new(File::create(file)?);

        for module in coverage {
            if module.symbols.is_empty() {
                continue;
            }

            write::module_header(&mut writer, &module.name, &module.path)?;
            for &id in &module.symbols {
                let symbol = self.cache.get(id);
                write::symbol_record(
                    &mut writer,
                    &SymbolRecord {
                        offset: symbol.offset,
                        file: symbol.file.clone(),
                        name: symbol.name.clone(),
                        line: symbol.line,
                    },
                )?;
            }
        }

        writer.flush()?;
        Ok(())
    }

    /// Backend queries issued so far.
    pub fn query_count(&self) -> usize {
        self.query_count
    }

    /// Queries answered from the cache so far.
    pub fn match_count(&self) -> usize {
        self.match_count
    }
}

fn matches_ext(path: &Path, ext: &str) -> bool {
    path.extension()
        .map_or(false, |found| format!(".{}", found.to_string_lossy()) == ext)
}
