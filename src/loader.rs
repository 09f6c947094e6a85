//! Target inspection: `/proc/<pid>` artifacts and ELF symbol
//! enumeration for breakpoint placement.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use log::debug;
use memmap2::Mmap;
use nix::unistd::Pid;
use object::{
    Object, ObjectSection, ObjectSymbol, ObjectSymbolTable, RelocationTarget, SymbolIndex,
    SymbolKind,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot resolve executable of pid {0}: {1}")]
    NotAttachable(Pid, #[source] io::Error),
    #[error("cannot read memory map of pid {0}: {1}")]
    MemoryMap(Pid, #[source] io::Error),
    #[error("cannot open image `{0}`: {1}")]
    Open(PathBuf, #[source] io::Error),
    #[error("corrupt image `{0}`: {1}")]
    CorruptImage(PathBuf, #[source] object::read::Error),
}

/// Resolves the target's executable via the `/proc/<pid>/exe` symlink.
pub fn resolve_executable_path(pid: Pid) -> Result<PathBuf, Error> {
    fs::read_link(format!("/proc/{}/exe", pid)).map_err(|err| Error::NotAttachable(pid, err))
}

/// Resolves a file descriptor of the target to the path it refers to.
/// Anonymous or vanished descriptors resolve to `None`.
pub fn resolve_fd_path(pid: Pid, fd: u64) -> Option<PathBuf> {
    fs::read_link(format!("/proc/{}/fd/{}", pid, fd)).ok()
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MapsEntry {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub path: String,
}

/// One line of `/proc/<pid>/maps`:
/// `7f676..000-7f676..000 r--p 00000000 08:10 6230  /usr/lib/.../libc.so.6`
pub(crate) fn parse_maps_line(line: &str) -> Option<MapsEntry> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let _perms = fields.next()?;
    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next().unwrap_or("").to_owned();

    let (start, end) = range.split_once('-')?;
    Some(MapsEntry {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        offset,
        path,
    })
}

/// Walks `/proc/<pid>/maps` and yields `(path, base)` for the first
/// mapped segment of every file (offset zero) whose path is not in
/// `ignore`. The visitor returns `true` to short-circuit the walk.
pub fn iterate_memory_map<F>(pid: Pid, ignore: &HashSet<String>, mut visitor: F) -> Result<(), Error>
where
    F: FnMut(&str, u64) -> bool,
{
    let file =
        File::open(format!("/proc/{}/maps", pid)).map_err(|err| Error::MemoryMap(pid, err))?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|err| Error::MemoryMap(pid, err))?;
        let Some(entry) = parse_maps_line(&line) else {
            continue;
        };
        if entry.offset != 0 || entry.path.is_empty() || ignore.contains(&entry.path) {
            continue;
        }
        if visitor(&entry.path, entry.start) {
            break;
        }
    }
    Ok(())
}

/// Collects the whole memory map, one entry per line.
pub(crate) fn read_memory_map(pid: Pid) -> Result<Vec<MapsEntry>, Error> {
    let file =
        File::open(format!("/proc/{}/maps", pid)).map_err(|err| Error::MemoryMap(pid, err))?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|err| Error::MemoryMap(pid, err))?;
        if let Some(entry) = parse_maps_line(&line) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Cheap ELF magic probe, used to skip non-library map entries before
/// paying for a full parse.
pub fn is_elf_file(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    match File::open(path) {
        Ok(mut file) => matches!(file.read_exact(&mut magic), Ok(()) if magic == *b"\x7fELF"),
        Err(_) => false,
    }
}

/// Whether a path names a shared object: the name contains `.so`
/// either at the end or followed by a version suffix (`.so.6`).
pub fn is_shared_object(path: &str) -> bool {
    const EXT: &str = ".so";
    match path.find(EXT) {
        Some(pos) => {
            let tail = pos + EXT.len();
            tail == path.len() || path.as_bytes()[tail] == b'.'
        }
        None => false,
    }
}

/// Maps the ELF image read-only and yields `(symbol_name, offset)` for
/// every exported function in `.dynsym`, or for every `.rela.plt`
/// relocation when `use_plt` is set. The visitor returns `true` to
/// short-circuit.
///
/// Truncated headers, sections pointing outside the image and string
/// references past the table all surface as `CorruptImage`; the caller
/// skips the library and keeps tracing.
pub fn iterate_symbols<F>(path: &Path, use_plt: bool, mut visitor: F) -> Result<(), Error>
where
    F: FnMut(&str, u64) -> bool,
{
    let file = File::open(path).map_err(|err| Error::Open(path.to_owned(), err))?;
    let data = unsafe { Mmap::map(&file) }.map_err(|err| Error::Open(path.to_owned(), err))?;
    let image = object::File::parse(&*data)
        .map_err(|err| Error::CorruptImage(path.to_owned(), err))?;

    if use_plt {
        let Some(section) = image.section_by_name(".rela.plt") else {
            return Ok(());
        };
        let Some(dynsyms) = image.dynamic_symbol_table() else {
            return Ok(());
        };
        for (offset, relocation) in section.relocations() {
            let RelocationTarget::Symbol(index) = relocation.target() else {
                continue;
            };
            if index == SymbolIndex(0) {
                continue;
            }
            let symbol = dynsyms
                .symbol_by_index(index)
                .map_err(|err| Error::CorruptImage(path.to_owned(), err))?;
            let name = symbol
                .name()
                .map_err(|err| Error::CorruptImage(path.to_owned(), err))?;
            if visitor(name, offset) {
                break;
            }
        }
    } else {
        for symbol in image.dynamic_symbols() {
            if symbol.kind() != SymbolKind::Text {
                continue;
            }
            let name = symbol
                .name()
                .map_err(|err| Error::CorruptImage(path.to_owned(), err))?;
            if visitor(name, symbol.address()) {
                break;
            }
        }
    }

    debug!("scanned symbols of {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_maps_line_with_path() {
        let entry = parse_maps_line(
            "7f6764831000-7f6764833000 r--p 00000000 08:10 6230 /usr/lib/x86_64-linux-gnu/ld-linux-x86-64.so.2",
        )
        .unwrap();
        assert_eq!(entry.start, 0x7f6764831000);
        assert_eq!(entry.end, 0x7f6764833000);
        assert_eq!(entry.offset, 0);
        assert_eq!(entry.path, "/usr/lib/x86_64-linux-gnu/ld-linux-x86-64.so.2");
    }

    #[test]
    fn parses_an_anonymous_maps_line() {
        let entry =
            parse_maps_line("7ffd4a9c2000-7ffd4a9e3000 rw-p 00000000 00:00 0 [stack]").unwrap();
        assert_eq!(entry.path, "[stack]");

        let entry = parse_maps_line("7ffd4a9c2000-7ffd4a9e3000 rw-p 00000000 00:00 0").unwrap();
        assert_eq!(entry.path, "");
    }

    #[test]
    fn rejects_garbage_lines() {
        assert_eq!(parse_maps_line(""), None);
        assert_eq!(parse_maps_line("not a maps line"), None);
    }

    #[test]
    fn nonzero_offset_segments_are_not_bases() {
        let entry = parse_maps_line(
            "7f6764a00000-7f6764b00000 r-xp 00026000 08:10 6230 /usr/lib/libc.so.6",
        )
        .unwrap();
        assert_ne!(entry.offset, 0);
    }

    #[test]
    fn shared_object_suffix_matching() {
        assert!(is_shared_object("/usr/lib/libc.so"));
        assert!(is_shared_object("/usr/lib/libc.so.6"));
        assert!(is_shared_object("/usr/lib/libfoo.so.1.2.3"));
        assert!(!is_shared_object("/usr/lib/libc.a"));
        assert!(!is_shared_object("/tmp/socket"));
        assert!(!is_shared_object("/usr/bin/resolver"));
    }

    #[test]
    fn elf_probe_rejects_short_and_non_elf_files() {
        let dir = tempfile::tempdir().unwrap();
        let short = dir.path().join("short");
        fs::write(&short, b"\x7fEL").unwrap();
        assert!(!is_elf_file(&short));

        let text = dir.path().join("text");
        fs::write(&text, b"#!/bin/sh\n").unwrap();
        assert!(!is_elf_file(&text));

        let missing = dir.path().join("missing");
        assert!(!is_elf_file(&missing));
    }

    #[test]
    fn corrupt_image_is_reported_not_panicked() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.so");
        fs::write(&bogus, b"\x7fELF but then garbage").unwrap();
        let result = iterate_symbols(&bogus, false, |_, _| false);
        assert!(matches!(result, Err(Error::CorruptImage(..))));
    }

    #[test]
    fn plt_walk_terminates_on_own_binary() {
        let exe = std::env::current_exe().unwrap();
        let mut relocations = 0usize;
        iterate_symbols(&exe, true, |_, _| {
            relocations += 1;
            false
        })
        .unwrap();
        // test binaries are dynamically linked; a missing .rela.plt
        // would still be a clean no-op
        let _ = relocations;
    }

    #[test]
    fn own_binary_exports_no_short_circuit_surprises() {
        // the test binary itself is a valid ELF with a dynamic symbol
        // table; the walk must terminate and honor short-circuiting
        let exe = std::env::current_exe().unwrap();
        let mut seen = 0usize;
        iterate_symbols(&exe, false, |_, _| {
            seen += 1;
            seen >= 3
        })
        .unwrap();
        assert!(seen <= 3);
    }
}
