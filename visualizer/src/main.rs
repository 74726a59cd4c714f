use anyhow::Result;
use clap::Parser;
use symbol_backend::{DebugInfoSource, ExtractedSymbols, SymbolSource};
use visualizer::{Visualizer, VisualizerOptions};

/// Emit an LCOV report from size-recording coverage dumps.
#[derive(Parser, Debug)]
struct Args {
    /// Root directory to search for coverage files.
    #[arg(long, default_value = ".")]
    root: std::path::PathBuf,

    /// Extension of coverage files.
    #[arg(long, default_value = ".log")]
    ext: String,

    /// Report only source files matching this regex.
    #[arg(long)]
    regex: Option<String>,

    /// Use pre-extracted `.binaryrts` symbol files.
    #[arg(long)]
    extracted: bool,

    /// Query the backend for offsets that are not line starts instead of
    /// using the predecessor trick.
    #[arg(long)]
    accurate: bool,

    /// Verbose diagnostics.
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut options = VisualizerOptions::new(args.root);
    options.ext = args.ext;
    options.source_regex = args.regex;
    options.accurate = args.accurate;

    let source: Box<dyn SymbolSource> = if args.extracted {
        Box::new(ExtractedSymbols::new())
    } else {
        Box::new(DebugInfoSource::new())
    };

    let mut visualizer = Visualizer::new(options, source)?;
    visualizer.run()
}
