//! DWARF symbolization of raw stack addresses against the live
//! target. A symbolizer is a snapshot of the target's module map; the
//! consumer rebuilds it whenever the engine reports a mapping change.

use std::fs;
use std::path::PathBuf;

use addr2line::Context;
use fnv::FnvHashMap as HashMap;
use gimli::{EndianRcSlice, RunTimeEndian};
use log::debug;
use nix::unistd::Pid;
use object::{Object, ObjectKind, ObjectSection, ObjectSymbol, SymbolKind};
use std::rc::Rc;

use crate::loader::{self, Error};

type DwarfContext = Context<EndianRcSlice<RunTimeEndian>>;

/// One symbolized stack address.
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: i32,
    pub column: i32,
}

struct Module {
    start: u64,
    end: u64,
    /// Subtracted from a virtual address to obtain the module-relative
    /// probe address; the mapped base for position-independent images,
    /// zero for fixed ones.
    bias: u64,
    /// Function symbols sorted by address, for names DWARF cannot
    /// supply.
    symbols: Vec<(u64, String)>,
    dwarf: Option<DwarfContext>,
}

impl Module {
    fn load(path: &str, start: u64, end: u64) -> Option<Self> {
        let data = fs::read(path).ok()?;
        let image = object::File::parse(&*data).ok()?;

        let bias = match image.kind() {
            ObjectKind::Dynamic => start,
            _ => 0,
        };

        let mut symbols = image
            .symbols()
            .chain(image.dynamic_symbols())
            .filter(|sym| sym.kind() == SymbolKind::Text)
            .filter_map(|sym| Some((sym.address(), sym.name().ok()?.to_owned())))
            .collect::<Vec<_>>();
        symbols.sort_by_key(|&(addr, _)| addr);
        symbols.dedup_by(|a, b| a.0 == b.0);

        let endian = if image.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };
        let load_section = |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
            let data = image
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
            Ok(EndianRcSlice::new(Rc::from(&*data), endian))
        };
        let dwarf = gimli::Dwarf::load(&load_section)
            .ok()
            .and_then(|dwarf| Context::from_dwarf(dwarf).ok());

        Some(Self {
            start,
            end,
            bias,
            symbols,
            dwarf,
        })
    }

    fn nearest_symbol(&self, probe: u64) -> Option<&str> {
        let index = match self.symbols.binary_search_by_key(&probe, |&(addr, _)| addr) {
            Ok(index) => index,
            Err(0) => return None,
            Err(index) => index - 1,
        };
        Some(&self.symbols[index].1)
    }

    fn resolve(&self, probe: u64) -> Resolved {
        let mut resolved = Resolved {
            line: -1,
            column: -1,
            ..Default::default()
        };

        if let Some(ctx) = &self.dwarf {
            if let Ok(mut frames) = ctx.find_frames(probe).skip_all_loads() {
                let mut innermost = true;
                while let Ok(Some(frame)) = frames.next() {
                    if innermost {
                        if let Some(location) = frame.location {
                            resolved.file = location.file.map(str::to_owned);
                            resolved.line = location.line.map_or(-1, |line| line as i32);
                            resolved.column = location.column.map_or(-1, |col| col as i32);
                        }
                        innermost = false;
                    }
                    // the last frame is the outermost real function
                    if let Some(function) = frame.function {
                        resolved.function =
                            function.demangle().ok().map(|name| name.into_owned());
                    }
                }
            }
        }

        if resolved.function.is_none() {
            resolved.function = self.nearest_symbol(probe).map(str::to_owned);
        }
        resolved
    }
}

/// Address-to-source resolution over every file-backed image currently
/// mapped into the target.
pub struct Symbolizer {
    modules: Vec<Module>,
}

impl Symbolizer {
    /// Snapshots `/proc/<pid>/maps` and loads every mapped ELF image.
    /// Images that fail to parse are silently absent; addresses inside
    /// them resolve to nothing.
    pub fn new(pid: Pid) -> Result<Self, Error> {
        let entries = loader::read_memory_map(pid)?;

        // coalesce per path: lowest offset-zero base, highest end
        let mut spans: HashMap<String, (u64, u64)> = HashMap::default();
        for entry in &entries {
            if entry.path.is_empty() || !entry.path.starts_with('/') {
                continue;
            }
            let span = spans
                .entry(entry.path.clone())
                .or_insert((u64::MAX, entry.end));
            if entry.offset == 0 {
                span.0 = span.0.min(entry.start);
            }
            span.1 = span.1.max(entry.end);
        }

        let mut modules = Vec::new();
        for (path, (start, end)) in spans {
            if start == u64::MAX || !loader::is_elf_file(PathBuf::from(&path).as_path()) {
                continue;
            }
            if let Some(module) = Module::load(&path, start, end) {
                modules.push(module);
            }
        }
        modules.sort_by_key(|module| module.start);
        debug!("symbolizer loaded {} modules for {}", modules.len(), pid);

        Ok(Self { modules })
    }

    /// Resolves a raw address. `None` when no mapped module owns it.
    pub fn resolve(&self, addr: u64) -> Option<Resolved> {
        let module = self
            .modules
            .iter()
            .find(|module| module.start <= addr && addr < module.end)?;
        Some(module.resolve(addr - module.bias))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(symbols: Vec<(u64, String)>) -> Module {
        Module {
            start: 0x1000,
            end: 0x9000,
            bias: 0,
            symbols,
            dwarf: None,
        }
    }

    #[test]
    fn nearest_symbol_picks_the_preceding_entry() {
        let module = fixture(vec![
            (0x1000, "alpha".to_owned()),
            (0x2000, "beta".to_owned()),
            (0x3000, "gamma".to_owned()),
        ]);
        assert_eq!(module.nearest_symbol(0x1000), Some("alpha"));
        assert_eq!(module.nearest_symbol(0x2fff), Some("beta"));
        assert_eq!(module.nearest_symbol(0x0fff), None);
    }

    #[test]
    fn dwarfless_module_falls_back_to_symbols() {
        let module = fixture(vec![(0x2000, "beta".to_owned())]);
        let resolved = module.resolve(0x2010);
        assert_eq!(resolved.function.as_deref(), Some("beta"));
        assert_eq!(resolved.file, None);
        assert_eq!(resolved.line, -1);
    }
}
