use std::fs;
use std::path::Path;

use anyhow::Result;
use pretty_assertions::assert_eq;
use resolver::{ResolverOptions, SymbolResolver};
use symbol_backend::{FakeSymbols, SymbolInfo};

fn app_symbols() -> FakeSymbols {
    FakeSymbols::new()
        .symbol(
            "/path/app",
            SymbolInfo {
                name: "foo()".into(),
                file: "/src/foo.cpp".into(),
                line: 42,
                start: 0x1000,
                end: 0x100f,
            },
        )
        .symbol(
            "/path/app",
            SymbolInfo {
                name: "foo()".into(),
                file: "/src/foo.cpp".into(),
                line: 43,
                start: 0x1010,
                end: 0x103f,
            },
        )
}

fn resolver_for(root: &Path) -> SymbolResolver<FakeSymbols> {
    SymbolResolver::new(ResolverOptions::new(root), app_symbols()).unwrap()
}

#[test]
fn rewrite_dedups_within_symbol_and_line() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("1.log");

    // Two blocks on distinct lines of the same function, plus one interior
    // to the first line's region.
    fs::write(
        &dump,
        "app\t/path/app\n\t+0x1000\t1\n\t+0x1010\t2\n\t+0x1008\t1\n",
    )?;

    let mut resolver = resolver_for(dir.path());
    resolver.analyze_coverage_file(&dump)?;

    assert_eq!(
        fs::read_to_string(&dump)?,
        "app\t/path/app\n\
         \t+0x1000\t/src/foo.cpp\tfoo()\t42\n\
         \t+0x1010\t/src/foo.cpp\tfoo()\t43\n"
    );
    assert_eq!(resolver.query_count(), 3);

    Ok(())
}

#[test]
fn same_line_neighbor_skips_the_backend() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("1.log");
    fs::write(&dump, "app\t/path/app\n\t+0x1000\t1\n\t+0x1004\t1\n")?;

    let mut resolver = resolver_for(dir.path());
    resolver.analyze_coverage_file(&dump)?;

    // The second offset was filled from the last-queried entry: one backend
    // query, one cache hit, one surviving record.
    assert_eq!(resolver.query_count(), 1);
    assert_eq!(resolver.match_count(), 1);
    assert_eq!(
        fs::read_to_string(&dump)?,
        "app\t/path/app\n\t+0x1000\t/src/foo.cpp\tfoo()\t42\n"
    );

    Ok(())
}

#[test]
fn rewrite_is_idempotent_on_symbolic_input() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("1.log");
    fs::write(&dump, "app\t/path/app\n\t+0x1000\t1\n\t+0x1010\t1\n")?;

    resolver_for(dir.path()).analyze_coverage_file(&dump)?;
    let first_pass = fs::read_to_string(&dump)?;

    // A second pass over the symbolic output, with a cold cache, reproduces
    // it byte for byte.
    resolver_for(dir.path()).analyze_coverage_file(&dump)?;
    assert_eq!(fs::read_to_string(&dump)?, first_pass);

    Ok(())
}

#[test]
fn failed_lookups_are_sticky() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("1.log");
    fs::write(&dump, "app\t/path/app\n\t+0x5000\t1\n")?;

    let mut resolver = resolver_for(dir.path());
    resolver.analyze_coverage_file(&dump)?;

    // No surviving symbol: the module section disappears.
    assert_eq!(fs::read_to_string(&dump)?, "");
    assert_eq!(resolver.query_count(), 1);

    // Replaying the original input never hits the backend again.
    fs::write(&dump, "app\t/path/app\n\t+0x5000\t1\n")?;
    resolver.analyze_coverage_file(&dump)?;
    assert_eq!(resolver.query_count(), 1);
    assert_eq!(resolver.match_count(), 1);

    Ok(())
}

#[test]
fn excluded_source_files_are_dropped() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("1.log");
    fs::write(&dump, "app\t/path/app\n\t+0x1000\t1\n\t+0x2000\t1\n")?;

    let symbols = app_symbols().symbol(
        "/path/app",
        SymbolInfo {
            name: "generated()".into(),
            file: "/build/gen.cpp".into(),
            line: 7,
            start: 0x2000,
            end: 0x200f,
        },
    );

    let mut options = ResolverOptions::new(dir.path());
    options.source_regex = Some("^/src/".to_owned());

    let mut resolver = SymbolResolver::new(options, symbols)?;
    resolver.analyze_coverage_file(&dump)?;

    assert_eq!(
        fs::read_to_string(&dump)?,
        "app\t/path/app\n\t+0x1000\t/src/foo.cpp\tfoo()\t42\n"
    );

    Ok(())
}

#[test]
fn binary_dumps_resolve() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("1.log");

    let mut data = Vec::new();
    dump_format::write::module_header(&mut data, "app", "/path/app")?;
    dump_format::write::offsets_run(&mut data, &[0x1000, 0x1010])?;
    fs::write(&dump, data)?;

    resolver_for(dir.path()).analyze_coverage_file(&dump)?;

    assert_eq!(
        fs::read_to_string(&dump)?,
        "app\t/path/app\n\
         \t+0x1000\t/src/foo.cpp\tfoo()\t42\n\
         \t+0x1010\t/src/foo.cpp\tfoo()\t43\n"
    );

    Ok(())
}

#[test]
fn extracted_symbols_replace_the_backend() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let module_path = dir.path().join("app");
    fs::write(
        dir.path().join("app.binaryrts"),
        "\t+0x1000\t/src/foo.cpp\tfoo()\t42\n",
    )?;

    let dump = dir.path().join("1.log");
    fs::write(
        &dump,
        format!(
            "app\t{}\n\t+0x1000\t1\n\t+0x2000\t1\n",
            module_path.display()
        ),
    )?;

    let mut options = ResolverOptions::new(dir.path());
    options.use_extracted = true;

    let mut resolver = SymbolResolver::new(options, FakeSymbols::new())?;
    resolver.analyze_coverage_file(&dump)?;

    assert_eq!(
        fs::read_to_string(&dump)?,
        format!(
            "app\t{}\n\t+0x1000\t/src/foo.cpp\tfoo()\t42\n",
            module_path.display()
        )
    );
    assert_eq!(resolver.query_count(), 0);

    Ok(())
}

#[test]
fn run_walks_the_tree_and_spares_reserved_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::create_dir(dir.path().join("sub"))?;

    let first = dir.path().join("1.log");
    let second = dir.path().join("sub").join("2.log");
    fs::write(&first, "app\t/path/app\n\t+0x1000\t1\n")?;
    fs::write(&second, "app\t/path/app\n\t+0x1010\t1\n")?;

    let lookup = dir.path().join("dump-lookup.log");
    let final_dump = dir.path().join("coverage.log");
    fs::write(&lookup, "1;t1___PASSED\n")?;
    fs::write(&final_dump, "app\t/path/app\n\t+0x1000\t1\n")?;

    resolver_for(dir.path()).run()?;

    assert_eq!(
        fs::read_to_string(&first)?,
        "app\t/path/app\n\t+0x1000\t/src/foo.cpp\tfoo()\t42\n"
    );
    assert_eq!(
        fs::read_to_string(&second)?,
        "app\t/path/app\n\t+0x1010\t/src/foo.cpp\tfoo()\t43\n"
    );

    // Reserved names are untouched.
    assert_eq!(fs::read_to_string(&lookup)?, "1;t1___PASSED\n");
    assert_eq!(
        fs::read_to_string(&final_dump)?,
        "app\t/path/app\n\t+0x1000\t1\n"
    );

    Ok(())
}
