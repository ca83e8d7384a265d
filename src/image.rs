//! Access to the object files (ELF and Mach-O) backing loaded modules.

use std::ffi::OsStr;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::fs::File;
use std::ops::Range;
use std::path::Path;

use memmap2::Mmap;
use object::read::macho::FatArch;
use object::read::macho::MachOFatFile32;
use object::read::macho::MachOFatFile64;
use object::Architecture;
use object::BinaryFormat;
use object::FileKind;
use object::Object as _;
use object::ObjectSegment as _;
use object::ObjectSymbol as _;
use object::SymbolKind;

use crate::util::bytes_to_os_str;
use crate::util::find_match_or_lower_bound_by_key;
use crate::Addr;
use crate::Error;
use crate::ErrorExt as _;
use crate::Reason;
use crate::Result;


/// The architecture we are running on, as named by `object`.
fn host_arch() -> Architecture {
    if cfg!(target_arch = "x86_64") {
        Architecture::X86_64
    } else if cfg!(target_arch = "aarch64") {
        Architecture::Aarch64
    } else if cfg!(target_arch = "x86") {
        Architecture::I386
    } else if cfg!(target_arch = "arm") {
        Architecture::Arm
    } else {
        Architecture::Unknown
    }
}

fn fat_range<A>(arches: &[A]) -> Result<Range<usize>>
where
    A: FatArch,
{
    let arch = arches
        .iter()
        .find(|arch| arch.architecture() == host_arch())
        .ok_or_else(|| {
            Error::with_not_found(
                "fat Mach-O file does not contain an image for the running architecture",
            )
        })?;
    let (offset, size) = arch.file_range();
    let start = offset as usize;
    Ok(start..start + size as usize)
}

/// Find the part of `data` containing the image to use. That is all of
/// it, unless `data` is a "fat" Mach-O file bundling images for
/// multiple architectures.
fn image_range(data: &[u8]) -> Result<Range<usize>> {
    let range = match FileKind::parse(data)? {
        FileKind::MachOFat32 => fat_range(MachOFatFile32::parse(data)?.arches())?,
        FileKind::MachOFat64 => fat_range(MachOFatFile64::parse(data)?.arches())?,
        _ => 0..data.len(),
    };

    if range.end > data.len() {
        return Err(Error::with_invalid_data(
            "fat Mach-O architecture entry is out of bounds",
        ))
    }
    Ok(range)
}


/// A function symbol.
#[derive(Clone, Debug, PartialEq)]
struct Symbol {
    addr: Addr,
    /// The symbol's size, zero if unknown.
    size: u64,
    name: Box<str>,
}

fn symbols(file: &object::File<'_>) -> Box<[Symbol]> {
    let macho = file.format() == BinaryFormat::MachO;
    let mut syms = file
        .symbols()
        .chain(file.dynamic_symbols())
        .filter(|sym| sym.kind() == SymbolKind::Text && sym.is_definition())
        .filter_map(|sym| {
            let name = sym.name().ok()?;
            // C level Mach-O symbols carry a leading underscore.
            let name = if macho {
                name.strip_prefix('_').unwrap_or(name)
            } else {
                name
            };
            if name.is_empty() {
                return None
            }

            let sym = Symbol {
                addr: sym.address() as Addr,
                size: sym.size(),
                name: Box::from(name),
            };
            Some(sym)
        })
        .collect::<Vec<_>>();

    // `.dynsym` mostly duplicates `.symtab`.
    let () = syms.sort_by(|a, b| a.addr.cmp(&b.addr).then_with(|| a.name.cmp(&b.name)));
    let () = syms.dedup();
    syms.into_boxed_slice()
}


/// A loadable segment.
#[derive(Clone, Debug, PartialEq)]
struct Segment {
    /// The virtual address the segment is loaded at.
    addr: Addr,
    file_offset: u64,
    file_size: u64,
}


/// A memory mapped object file.
///
/// Symbols and segments are extracted when the file is opened. All
/// other data is read on demand, from the mapping.
pub(crate) struct Image {
    /// Function symbols, sorted by address.
    symbols: Box<[Symbol]>,
    segments: Box<[Segment]>,
    /// The part of `mmap` holding the image.
    range: Range<usize>,
    mmap: Mmap,
}

impl Image {
    /// Open and parse the object file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        if file.metadata()?.len() == 0 {
            return Err(Error::with_invalid_data(format!(
                "{} is empty",
                path.display()
            )))
        }

        // SAFETY: The mapping is read-only. Concurrent modification of
        //         the file is outside of our control and accepted.
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to memory map {}", path.display()))?;
        Self::from_mmap(mmap).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn from_mmap(mmap: Mmap) -> Result<Self> {
        let range = image_range(&mmap)?;
        let (segments, symbols) = {
            let file = object::File::parse(&mmap[range.clone()])?;
            let segments = file
                .segments()
                .map(|segment| {
                    let (file_offset, file_size) = segment.file_range();
                    Segment {
                        addr: segment.address() as Addr,
                        file_offset,
                        file_size,
                    }
                })
                .collect();
            (segments, symbols(&file))
        };

        let slf = Self {
            symbols,
            segments,
            range,
            mmap,
        };
        Ok(slf)
    }

    /// Retrieve the entire contents of the file.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.mmap
    }

    /// Parse the image for accessing data other than symbols and
    /// segments.
    pub fn parse(&self) -> Result<object::File<'_>> {
        let file = object::File::parse(&self.mmap[self.range.clone()])?;
        Ok(file)
    }

    /// Check whether the image contains DWARF debug information.
    pub fn has_dwarf(&self) -> bool {
        self.parse()
            .map(|file| file.section_by_name(".debug_info").is_some())
            .unwrap_or(false)
    }

    /// Read the image's `.gnu_debuglink`, if it has one: the file name
    /// of the separate debug file and its CRC32 checksum.
    pub fn debug_link(&self) -> Result<Option<(&OsStr, u32)>> {
        let link = self
            .parse()?
            .gnu_debuglink()?
            .map(|(file, crc)| (bytes_to_os_str(file), crc));
        Ok(link)
    }

    /// Convert a file offset into the virtual address it is loaded at.
    pub fn find_virt_addr(&self, file_offset: u64) -> Option<Addr> {
        self.segments.iter().find_map(|segment| {
            let range = segment.file_offset..segment.file_offset + segment.file_size;
            if range.contains(&file_offset) {
                Some((file_offset - segment.file_offset) as Addr + segment.addr)
            } else {
                None
            }
        })
    }

    /// Look up the function symbol containing the virtual address
    /// `addr`, returning its name and start address.
    ///
    /// Symbols without size (all of them, for Mach-O) are considered to
    /// extend up to the next symbol.
    pub fn find_sym(&self, addr: Addr) -> Result<(&str, Addr), Reason> {
        if self.symbols.is_empty() {
            return Err(Reason::MissingSymbols)
        }

        let idx = find_match_or_lower_bound_by_key(&self.symbols, addr, |sym| sym.addr)
            .ok_or(Reason::UnknownAddr)?;
        let sym = self.symbols[idx..]
            .iter()
            .take_while(|sym| sym.addr <= addr)
            .filter(|sym| sym.size == 0 || addr < sym.addr + sym.size as Addr)
            .last()
            .ok_or(Reason::UnknownAddr)?;
        Ok((&sym.name, sym.addr))
    }
}

impl Debug for Image {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Image")
            .field("symbols", &self.symbols.len())
            .field("segments", &self.segments)
            .field("range", &self.range)
            .finish()
    }
}
