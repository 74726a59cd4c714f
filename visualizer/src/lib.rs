//! Line-level coverage visualisation.
//!
//! Converts text-mode dumps carrying (block start, block size) pairs into
//! per-file covered/uncovered line sets and emits an LCOV report. Interior
//! offsets are resolved from the enumerated line starts of the module
//! instead of paying a symbol query per offset.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use dump_format::{DumpEvent, DumpReader, DUMP_LOOKUP_FILE};
use log::{debug, error, info, warn};
use regex::Regex;
use symbol_backend::{DebugKind, SymbolSource};
use walkdir::WalkDir;

pub mod lines;

use lines::{CoveredLine, LineCache};

/// Name of the emitted LCOV report, placed next to the dumps.
pub const LCOV_FILE: &str = "coverage.info";

#[derive(Clone, Debug)]
pub struct VisualizerOptions {
    pub root: PathBuf,
    pub ext: String,
    pub source_regex: Option<String>,

    /// Query the backend for offsets that are not line starts instead of
    /// using the predecessor/successor trick.
    pub accurate: bool,
}

impl VisualizerOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ext: dump_format::DEFAULT_DUMP_EXT.to_owned(),
            source_regex: None,
            accurate: false,
        }
    }
}

/// Covered and uncovered line sets for one source file.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct FileLines {
    pub covered: std::collections::BTreeSet<u64>,
    pub uncovered: std::collections::BTreeSet<u64>,
}

pub type LineCoverage = BTreeMap<String, FileLines>;

pub struct Visualizer<S> {
    options: VisualizerOptions,
    regex: Option<Regex>,
    cache: LineCache,
    source: S,
    coverage: LineCoverage,
}

impl<S: SymbolSource> Visualizer<S> {
    pub fn new(options: VisualizerOptions, source: S) -> Result<Self> {
        let regex = options
            .source_regex
            .as_deref()
            .map(Regex::new)
            .transpose()?;

        Ok(Self {
            options,
            regex,
            cache: LineCache::default(),
            source,
            coverage: LineCoverage::new(),
        })
    }

    pub fn run(&mut self) -> Result<()> {
        let started = Instant::now();

        self.walk_coverage_files()?;
        self.write_lcov(&self.options.root.join(LCOV_FILE))?;

        info!("took {}ms to finish", started.elapsed().as_millis());
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

            if entry.file_name().to_string_lossy() == DUMP_LOOKUP_FILE {
                continue;
            }
            if !matches_ext(entry.path(), &self.options.ext) {
                continue;
            }

            if let Err(err) = self.analyze_coverage_file(entry.path()) {
                warn!("skipping {}: {err}", entry.path().display());
            }
        }

        Ok(())
    }

    pub fn analyze_coverage_file(&mut self, file: &Path) -> Result<()> {
        debug!("analyzing coverage file {}", file.display());

        let reader = DumpReader::new(BufReader::new(File::open(file)?));
        let mut current: Option<String> = None;

        for event in reader {
            match event? {
                DumpEvent::Module { path, .. } => {
                    if !self.cache.has_module(&path) {
                        self.add_module_lines(&path);
                    }
                    current = Some(path);
                }
                DumpEvent::Block { offset, data } => {
                    if let Some(module) = current.clone() {
                        self.process_block(&module, offset, data);
                    }
                }
                // Only text dumps with sizes carry line-coverage
                // information.
                DumpEvent::Symbol(_) | DumpEvent::Offsets(_) => {}
            }
        }

        debug!("finished processing {}", file.display());
        Ok(())
    }

    /// Enumerate every source line of a newly seen module. All enumerated
    /// lines start out uncovered.
    fn add_module_lines(&mut self, module: &str) {
        let cache = &mut self.cache;
        let coverage = &mut self.coverage;

        let result = self.source.enumerate_lines(Path::new(module), &mut |record| {
            cache.add_line(
                module,
                CoveredLine {
                    file: record.file.clone(),
                    line: record.line,
                    offset: record.offset,
                },
            );
            coverage
                .entry(record.file.clone())
                .or_default()
                .uncovered
                .insert(record.line);
        });

        match result {
            Ok(()) => info!("successfully enumerated lines for module {module}"),
            Err(err) => {
                let kind = self
                    .source
                    .module_debug_kind(Path::new(module))
                    .unwrap_or(DebugKind::None);
                error!("failed to enumerate lines for module {module} (debug info: {kind:?}): {err}");
            }
        }
    }

    /// Move every line spanned by the block from uncovered to covered. A
    /// block whose start or end cannot be placed on a line contributes
    /// nothing.
    fn process_block(&mut self, module: &str, start: u64, size: u64) {
        if self.cache.has_recorded_bb(module, start) {
            return;
        }
        self.cache.record_bb(module, start);

        let accurate = self.options.accurate;
        let Some(start_line) = self
            .cache
            .find_line(module, start, &mut self.source, accurate)
        else {
            return;
        };
        let end_line = self
            .cache
            .find_line(module, start + size, &mut self.source, accurate);

        let file = self.coverage.entry(start_line.file.clone()).or_default();
        if let Some(end_line) = end_line {
            for line in start_line.line..=end_line.line {
                if file.uncovered.remove(&line) {
                    file.covered.insert(line);
                }
            }
        }
    }

    pub fn write_lcov(&self, path: &Path) -> Result<()> {
        debug!("starting to write LCOV file to {}", path.display());

        let mut writer = BufWriter::new(File::create(path)?);
        for (file, lines) in &self.coverage {
            if let Some(regex) = &self.regex {
                if !regex.is_match(file) {
                    continue;
                }
            }

            writeln!(writer, "SF:{file}")?;
            for line in &lines.covered {
                writeln!(writer, "DA:{line},1")?;
            }
            for line in &lines.uncovered {
                writeln!(writer, "DA:{line},0")?;
            }
            writeln!(writer, "end_of_record")?;
        }
        writer.flush()?;

        debug!("done writing LCOV file");
        Ok(())
    }

    pub fn coverage(&self) -> &LineCoverage {
        &self.coverage
    }
}

fn matches_ext(path: &Path, ext: &str) -> bool {
    path.extension()
        .map_or(false, |found| format!(".{}", found.to_string_lossy()) == ext)
}
