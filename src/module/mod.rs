//! An index of the modules (executable and shared objects) loaded into
//! the process.

#[cfg(target_vendor = "apple")]
mod darwin;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(windows)]
mod windows;

use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use crate::log;
use crate::util::find_match_or_lower_bound_by_key;
use crate::Addr;
use crate::Result;

#[cfg(target_vendor = "apple")]
use darwin::enumerate as enumerate_modules;
#[cfg(target_os = "linux")]
use linux::enumerate as enumerate_modules;
#[cfg(windows)]
use windows::enumerate as enumerate_modules;

#[cfg(not(any(target_os = "linux", target_vendor = "apple", windows)))]
fn enumerate_modules() -> Result<Vec<Module>> {
    Ok(Vec::new())
}


/// A contiguous part of a module's file mapped into memory.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct Segment {
    /// The virtual address range covered.
    pub range: Range<Addr>,
    /// The offset into the file at which `range` starts.
    pub file_offset: u64,
}


/// A module loaded into the process.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Module {
    /// The address the module starts at.
    pub base: Addr,
    /// The address one past the module's last byte.
    pub end: Addr,
    /// The path of the module's file.
    pub path: PathBuf,
    /// The module's object name, typically the file name of `path`.
    pub name: String,
    /// The path used for opening the module's file, which may differ
    /// from `path` (e.g., for deleted files).
    pub(crate) file: PathBuf,
    /// The module's segments, in address order.
    pub(crate) segments: Box<[Segment]>,
}

impl Module {
    pub(crate) fn new(path: PathBuf, file: PathBuf, segments: Vec<Segment>) -> Option<Self> {
        let base = segments.iter().map(|segment| segment.range.start).min()?;
        let end = segments.iter().map(|segment| segment.range.end).max()?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut segments = segments;
        let () = segments.sort_by_key(|segment| segment.range.start);

        let module = Self {
            base,
            end,
            path,
            name,
            file,
            segments: segments.into_boxed_slice(),
        };
        Some(module)
    }

    /// Check whether `addr` belongs to this module.
    #[inline]
    pub fn contains(&self, addr: Addr) -> bool {
        (self.base..self.end).contains(&addr)
    }

    /// Retrieve the path of the file to read the module's data from.
    #[inline]
    pub(crate) fn file(&self) -> &Path {
        &self.file
    }

    /// Convert a virtual address inside the module into an offset
    /// into the module's file.
    pub(crate) fn file_offset(&self, addr: Addr) -> Option<u64> {
        let segment = self
            .segments
            .iter()
            .find(|segment| segment.range.contains(&addr))?;
        let offset = (addr - segment.range.start) as u64 + segment.file_offset;
        Some(offset)
    }
}


type Enumerate = fn() -> Result<Vec<Module>>;


/// An index of the modules loaded into the process, sorted by address.
///
/// The index is built lazily on first use and rebuilt once whenever an
/// address lookup fails, to pick up modules loaded in the meantime.
#[derive(Debug)]
pub struct ModuleIndex {
    modules: Option<Box<[Arc<Module>]>>,
    enumerate: Enumerate,
}

impl ModuleIndex {
    /// Create a new, not yet built, `ModuleIndex` for the current
    /// process.
    pub fn new() -> Self {
        Self::with_enumerator(enumerate_modules)
    }

    pub(crate) fn with_enumerator(enumerate: Enumerate) -> Self {
        Self {
            modules: None,
            enumerate,
        }
    }

    fn build(&self) -> Box<[Arc<Module>]> {
        let mut modules = match (self.enumerate)() {
            Ok(modules) => modules,
            Err(err) => {
                log::warn!("failed to enumerate loaded modules: {err}");
                Vec::new()
            }
        };
        let () = modules.sort_by_key(|module| module.base);

        let mut index = Vec::<Arc<Module>>::with_capacity(modules.len());
        for module in modules {
            if let Some(last) = index.last() {
                if module.base < last.end {
                    log::debug!(
                        "ignoring module {} overlapping with {}",
                        module.path.display(),
                        last.path.display()
                    );
                    continue
                }
            }
            let () = index.push(Arc::new(module));
        }

        log::debug!("indexed {} loaded modules", index.len());
        index.into_boxed_slice()
    }

    /// Retrieve the loaded modules, sorted by base address.
    pub fn modules(&mut self) -> &[Arc<Module>] {
        if self.modules.is_none() {
            self.modules = Some(self.build());
        }
        self.modules.as_deref().unwrap_or(&[])
    }

    fn lookup(&mut self, addr: Addr) -> Option<Arc<Module>> {
        let modules = self.modules();
        let idx = find_match_or_lower_bound_by_key(modules, addr, |module| module.base)?;
        let module = modules.get(idx)?;
        module.contains(addr).then(|| Arc::clone(module))
    }

    /// Find the module containing `addr`.
    ///
    /// If no module is found, the index is rebuilt and the lookup
    /// retried once.
    pub fn find(&mut self, addr: Addr) -> Option<Arc<Module>> {
        let fresh = self.modules.is_none();
        if let Some(module) = self.lookup(addr) {
            return Some(module)
        }

        if fresh {
            return None
        }

        log::trace!("address {addr:#x} not found in module index; rebuilding");
        let () = self.invalidate();
        self.lookup(addr)
    }

    /// Discard the current index, causing it to be rebuilt on next use.
    pub fn invalidate(&mut self) {
        self.modules = None;
    }
}

impl Default for ModuleIndex {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use test_log::test;


    fn module(path: &str, range: Range<Addr>) -> Module {
        let segment = Segment {
            range,
            file_offset: 0x1000,
        };
        Module::new(PathBuf::from(path), PathBuf::from(path), vec![segment]).unwrap()
    }

    fn two_modules() -> Result<Vec<Module>> {
        Ok(vec![
            module("/usr/lib/libb.so", 0x5000..0x6000),
            module("/usr/lib/liba.so", 0x1000..0x3000),
            // Overlapping modules are dropped.
            module("/usr/lib/libc.so", 0x2000..0x4000),
        ])
    }

    /// Check that lookups return the owning module and never a
    /// neighbor.
    #[test]
    fn module_lookup() {
        let mut index = ModuleIndex::with_enumerator(two_modules);
        let modules = index.modules();
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].name, "liba.so");
        assert_eq!(modules[1].name, "libb.so");

        assert_eq!(index.find(0x1000).unwrap().name, "liba.so");
        assert_eq!(index.find(0x2fff).unwrap().name, "liba.so");
        assert_eq!(index.find(0x5800).unwrap().name, "libb.so");
        assert_eq!(index.find(0xfff), None);
        assert_eq!(index.find(0x3000), None);
        assert_eq!(index.find(0x4fff), None);
        assert_eq!(index.find(0x6000), None);
    }

    /// Check that a failed lookup rebuilds the index, once.
    #[test]
    fn rebuild_on_miss() {
        static BUILDS: AtomicUsize = AtomicUsize::new(0);

        fn growing() -> Result<Vec<Module>> {
            let builds = BUILDS.fetch_add(1, Ordering::SeqCst);
            let mut modules = vec![module("/bin/main", 0x1000..0x2000)];
            if builds > 0 {
                modules.push(module("/usr/lib/libdl.so", 0x8000..0x9000));
            }
            Ok(modules)
        }

        let mut index = ModuleIndex::with_enumerator(growing);
        assert_eq!(index.find(0x1800).unwrap().name, "main");
        assert_eq!(BUILDS.load(Ordering::SeqCst), 1);

        // The library "appeared" after the index was built.
        assert_eq!(index.find(0x8800).unwrap().name, "libdl.so");
        assert_eq!(BUILDS.load(Ordering::SeqCst), 2);

        // A miss triggers exactly one rebuild.
        assert_eq!(index.find(0x20000), None);
        assert_eq!(BUILDS.load(Ordering::SeqCst), 3);
    }

    /// Make sure that enumeration errors result in an empty index.
    #[test]
    fn enumeration_failure() {
        fn failing() -> Result<Vec<Module>> {
            Err(crate::Error::with_unsupported("no modules here"))
        }

        let mut index = ModuleIndex::with_enumerator(failing);
        assert!(index.modules().is_empty());
        assert_eq!(index.find(0x1000), None);
    }

    /// Check the translation of addresses to file offsets.
    #[test]
    fn file_offset_translation() {
        let module = module("/usr/lib/liba.so", 0x1000..0x3000);
        assert_eq!(module.file_offset(0x1000), Some(0x1000));
        assert_eq!(module.file_offset(0x1234), Some(0x1234));
        assert_eq!(module.file_offset(0x3000), None);
        assert!(module.contains(0x2fff));
    }

    /// Check that the module index of the running process covers our
    /// own code.
    #[cfg(any(target_os = "linux", target_vendor = "apple", windows))]
    #[test]
    fn own_module() {
        let mut index = ModuleIndex::new();
        let addr = own_module as Addr;
        let module = index.find(addr).unwrap();
        assert!(module.contains(addr));
        assert!(module.file().exists(), "{}", module.file().display());
        assert!(module.file_offset(addr).is_some());
    }
}
