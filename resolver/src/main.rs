use anyhow::Result;
use clap::Parser;
use resolver::{ResolverOptions, SymbolResolver};
use symbol_backend::DebugInfoSource;

/// Rewrite per-test coverage dumps as symbolic records.
#[derive(Parser, Debug)]
struct Args {
    /// Root directory to search for coverage files.
    #[arg(long, default_value = ".")]
    root: std::path::PathBuf,

    /// Extension of coverage files.
    #[arg(long, default_value = ".log")]
    ext: String,

    /// Keep only symbols whose source file matches this regex.
    #[arg(long)]
    regex: Option<String>,

    /// Use pre-extracted `.binaryrts` symbol files; disables online
    /// resolution.
    #[arg(long)]
    extracted: bool,

    /// Verbose diagnostics.
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let mut options = ResolverOptions::new(args.root);
    options.ext = args.ext;
    options.source_regex = args.regex;
    options.use_extracted = args.extracted;

    let mut resolver = SymbolResolver::new(options, DebugInfoSource::new())?;
    resolver.run()
}
