use std::fs;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::ops::Range;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::IntoError as _;
use crate::Result;

use super::Module;
use super::Segment;


/// The suffix the kernel appends to paths of files that got deleted.
const DELETED_SUFFIX: &str = " (deleted)";


#[derive(Debug)]
struct MapsEntry {
    /// The virtual address range covered by this entry.
    range: Range<Addr>,
    mode: u8,
    offset: u64,
    /// The path as reported, minus any "deleted" marker.
    path: PathBuf,
    /// The path through which the mapped file can be accessed.
    file: PathBuf,
}

impl MapsEntry {
    fn is_executable(&self) -> bool {
        // Only entries that are executable and readable (r-x-) are of relevance.
        (self.mode & 0b1010) == 0b1010
    }
}


/// Parse a line of a proc maps file.
fn parse_maps_line<'line>(line: &'line str) -> Result<MapsEntry> {
    let full_line = line;

    let split_once = |line: &'line str, component| -> Result<(&'line str, &'line str)> {
        line.split_once(|c: char| c.is_ascii_whitespace())
            .ok_or_invalid_data(|| {
                format!("failed to find {component} in proc maps line: {full_line}")
            })
    };

    // Lines have the following format:
    // address           perms offset  dev   inode      pathname
    // 08048000-08049000 r-xp 00000000 03:00 8312       /opt/test
    // 0804a000-0806b000 rw-p 00000000 00:00 0          [heap]
    // a7cb1000-a7cb2000 ---p 00000000 00:00 0
    // a7ed5000-a8008000 r-xp 00000000 03:00 4222       /lib/libc.so.6
    let (address_str, line) = split_once(line, "address range")?;
    let (start_str, end_str) = address_str.split_once('-').ok_or_invalid_data(|| {
        format!("encountered malformed address range in proc maps line: {full_line}")
    })?;
    let start = Addr::from_str_radix(start_str, 16)
        .map_err(Error::with_invalid_data)
        .with_context(|| {
            format!("encountered malformed start address in proc maps line: {full_line}")
        })?;
    let end = Addr::from_str_radix(end_str, 16)
        .map_err(Error::with_invalid_data)
        .with_context(|| {
            format!("encountered malformed end address in proc maps line: {full_line}")
        })?;

    let (mode_str, line) = split_once(line, "permissions component")?;
    let mode = mode_str
        .chars()
        .fold(0, |mode, c| (mode << 1) | u8::from(c != '-'));

    let (offset_str, line) = split_once(line, "offset component")?;
    let offset = u64::from_str_radix(offset_str, 16)
        .map_err(Error::with_invalid_data)
        .with_context(|| {
            format!("encountered malformed offset component in proc maps line: {full_line}")
        })?;

    let (_dev, line) = split_once(line, "device component")?;
    // Note that by design, a path may not be present and so we may not be able
    // to successfully split.
    let path_str = split_once(line, "inode component")
        .map(|(_inode, line)| line.trim())
        .unwrap_or("");
    let (path, file) = if let Some(path_str) = path_str.strip_suffix(DELETED_SUFFIX) {
        (
            PathBuf::from(path_str),
            PathBuf::from(format!("/proc/self/map_files/{address_str}")),
        )
    } else {
        (PathBuf::from(path_str), PathBuf::from(path_str))
    };

    let entry = MapsEntry {
        range: start..end,
        mode,
        offset,
        path,
        file,
    };
    Ok(entry)
}


#[derive(Debug)]
struct MapsEntryIter<R> {
    reader: R,
    line: String,
}

impl<R> Iterator for MapsEntryIter<R>
where
    R: BufRead,
{
    type Item = Result<MapsEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let () = self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Err(err) => return Some(Err(err.into())),
                Ok(0) => break None,
                Ok(_) => {
                    let line_str = self.line.trim();
                    // There shouldn't be any empty lines, but we'd just ignore them. We
                    // need to trim anyway.
                    if !line_str.is_empty() {
                        let result = parse_maps_line(line_str);
                        break Some(result)
                    }
                }
            }
        }
    }
}


/// Parse a proc maps file from the provided reader.
fn parse_file<R>(reader: R) -> impl Iterator<Item = Result<MapsEntry>>
where
    R: Read,
{
    MapsEntryIter {
        reader: BufReader::new(reader),
        line: String::new(),
    }
}

/// Check whether a group of entries describes a module relevant to
/// symbolization.
fn is_symbolization_relevant(entries: &[MapsEntry]) -> bool {
    let entry = if let Some(entry) = entries.first() {
        entry
    } else {
        return false
    };

    // Only entries with actual paths are of relevance.
    if entry.path.as_path().components().next() != Some(Component::RootDir) {
        return false
    }

    if !entries.iter().any(MapsEntry::is_executable) {
        return false
    }

    entry
        .file
        .metadata()
        .map(|meta_data| meta_data.is_file())
        .unwrap_or(false)
}

fn make_module(entries: &[MapsEntry], exe: Option<&Path>) -> Option<Module> {
    if !is_symbolization_relevant(entries) {
        return None
    }

    let entry = entries.first()?;
    let segments = entries
        .iter()
        .map(|entry| Segment {
            range: entry.range.clone(),
            file_offset: entry.offset,
        })
        .collect();
    // The main executable is always accessible through `/proc/self/exe`,
    // even if it got replaced on disk.
    let file = if exe == Some(entry.path.as_path()) && entry.file == entry.path {
        PathBuf::from("/proc/self/exe")
    } else {
        entry.file.clone()
    };
    Module::new(entry.path.clone(), file, segments)
}

/// Group consecutive entries belonging to the same file into modules.
fn group_modules<I>(entries: I, exe: Option<&Path>) -> Result<Vec<Module>>
where
    I: IntoIterator<Item = Result<MapsEntry>>,
{
    let mut modules = Vec::new();
    let mut group = Vec::<MapsEntry>::new();

    for entry in entries {
        let entry = entry?;
        if let Some(last) = group.last() {
            if last.path != entry.path || last.range.end > entry.range.start {
                if let Some(module) = make_module(&group, exe) {
                    let () = modules.push(module);
                }
                let () = group.clear();
            }
        }
        let () = group.push(entry);
    }

    if let Some(module) = make_module(&group, exe) {
        let () = modules.push(module);
    }
    Ok(modules)
}

/// Enumerate the modules loaded into the current process.
pub(super) fn enumerate() -> Result<Vec<Module>> {
    let path = "/proc/self/maps";
    let file = File::open(path).with_context(|| format!("failed to open {path}"))?;
    let exe = fs::read_link("/proc/self/exe").ok();
    group_modules(parse_file(file), exe.as_deref())
}
