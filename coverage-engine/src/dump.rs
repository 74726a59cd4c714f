//! Serialisation of the live coverage map.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use dump_format::{write, SymbolRecord};
use log::debug;
use symbol_backend::SymbolSource;

use crate::block::CoverageData;
use crate::syscalls::OpenedFiles;
use crate::Options;

pub(crate) struct DumpRequest<'a> {
    pub dump_file: &'a mut dyn Write,
    /// Clear hit counts (and the opened-files sequence) after dumping.
    pub reset: bool,
    pub syscalls_file: Option<&'a mut dyn Write>,
}

/// Write every covered module with at least one block, then the opened-files
/// companion if requested.
pub(crate) fn dump_coverage(
    data: &CoverageData,
    opened_files: Option<&OpenedFiles>,
    options: &Options,
    mut symbols: Option<&mut dyn SymbolSource>,
    request: &mut DumpRequest<'_>,
) -> Result<()> {
    for module in data.modules() {
        let blocks = module.snapshot();
        if blocks.is_empty() {
            continue;
        }

        write::module_header(request.dump_file, &module.name, &module.path)?;

        if let Some(symbols) = symbols.as_mut() {
            for entry in &blocks {
                if entry.value() > 0 || options.dump_bb_size {
                    // Blocks the backend cannot place are dropped.
                    if let Ok(Some(info)) =
                        symbols.lookup_address(Path::new(&module.path), entry.offset() as u64)
                    {
                        write::symbol_record(
                            request.dump_file,
                            &SymbolRecord {
                                offset: entry.offset() as u64,
                                file: info.file,
                                name: info.name,
                                line: info.line,
                            },
                        )?;
                    }
                    if request.reset {
                        entry.reset();
                    }
                }
            }
        } else if options.text_dump {
            for entry in &blocks {
                if entry.value() > 0 || options.dump_bb_size {
                    write::text_block(request.dump_file, entry.offset() as u64, entry.value() as u64)?;
                    if request.reset {
                        entry.reset();
                    }
                }
            }
        } else {
            let mut offsets = Vec::with_capacity(blocks.len());
            for entry in &blocks {
                if entry.value() > 0 || options.dump_bb_size {
                    offsets.push(entry.offset() as usize);
                    if request.reset {
                        entry.reset();
                    }
                }
            }
            write::offsets_run(request.dump_file, &offsets)?;
        }
    }

    if let (Some(opened), Some(file)) = (opened_files, request.syscalls_file.as_mut()) {
        let paths = opened.snapshot();
        debug!("dumping {} opened files", paths.len());
        write::opened_files(&mut **file, &paths)?;

        if request.reset {
            opened.reset();
        }
    }

    Ok(())
}
