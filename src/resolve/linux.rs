//! Resolution of addresses in ELF modules, using DWARF debug information
//! and ELF symbol tables.

use crate::image::Image;
use crate::log;
use crate::module::Module;
use crate::Addr;
use crate::ErrorExt as _;
use crate::Reason;
use crate::Result;

use super::debug_link::find_debug_file;
#[cfg(feature = "dwarf")]
use super::dwarf::DwarfContext;
use super::DebugSession;
use super::Lookup;
use super::Options;
use super::SymFrame;


/// A debug session for an ELF module.
#[derive(Debug)]
pub(crate) struct Session {
    /// The DWARF context, if debug information is available.
    #[cfg(feature = "dwarf")]
    dwarf: Option<DwarfContext>,
    /// A separate debug file, found via the module's debug link.
    debug_file: Option<Image>,
    /// The module's file.
    image: Image,
    /// Whether to consult symbol tables.
    symbol_table: bool,
}

impl Session {
    /// Look up the function symbol containing the file address `addr`.
    fn find_sym(&self, addr: Addr) -> Result<String, Reason> {
        let images = [Some(&self.image), self.debug_file.as_ref()];
        let mut reason = Reason::MissingSymbols;

        for image in images.into_iter().flatten() {
            match image.find_sym(addr) {
                Ok((name, _addr)) => return Ok(name.to_string()),
                Err(Reason::UnknownAddr) => reason = Reason::UnknownAddr,
                Err(_) => (),
            }
        }
        Err(reason)
    }

    #[cfg(feature = "dwarf")]
    fn find_frames(&self, addr: Addr) -> Result<Vec<SymFrame>> {
        match &self.dwarf {
            Some(context) => context.find_frames(addr),
            None => Ok(Vec::new()),
        }
    }

    #[cfg(not(feature = "dwarf"))]
    fn find_frames(&self, _addr: Addr) -> Result<Vec<SymFrame>> {
        Ok(Vec::new())
    }

    #[cfg(feature = "dwarf")]
    fn has_debug_info(&self) -> bool {
        self.dwarf.is_some()
    }

    #[cfg(not(feature = "dwarf"))]
    fn has_debug_info(&self) -> bool {
        false
    }
}

impl DebugSession for Session {
    fn open(module: &Module, opts: &Options) -> Result<Self> {
        let image = Image::open(module.file())
            .with_context(|| format!("failed to open ELF file {}", module.path.display()))?;

        let debug_file = if opts.debug_info && opts.debug_link && !image.has_dwarf() {
            find_debug_file(&module.path, &image)
        } else {
            None
        };

        #[cfg(feature = "dwarf")]
        let dwarf = if opts.debug_info {
            let source = debug_file
                .as_ref()
                .filter(|image| image.has_dwarf())
                .unwrap_or(&image);
            if source.has_dwarf() {
                match DwarfContext::load(source) {
                    Ok(context) => Some(context),
                    Err(err) => {
                        log::warn!(
                            "failed to load DWARF information of {}: {err}",
                            module.path.display()
                        );
                        None
                    }
                }
            } else {
                None
            }
        } else {
            None
        };

        let slf = Self {
            #[cfg(feature = "dwarf")]
            dwarf,
            debug_file,
            image,
            symbol_table: opts.symbol_table,
        };
        Ok(slf)
    }

    fn lookup(&self, module: &Module, addr: Addr) -> Result<Lookup, Reason> {
        let offset = module.file_offset(addr).ok_or(Reason::UnknownAddr)?;
        let virt_addr = self
            .image
            .find_virt_addr(offset)
            .ok_or(Reason::UnknownAddr)?;

        let frames = match self.find_frames(virt_addr) {
            Ok(frames) => frames,
            Err(err) => {
                log::debug!("failed to look up DWARF frames for {virt_addr:#x}: {err}");
                Vec::new()
            }
        };

        let object_function = if self.symbol_table {
            match self.find_sym(virt_addr) {
                Ok(name) => Some(name),
                Err(reason) if frames.is_empty() => return Err(reason),
                Err(_) => None,
            }
        } else {
            None
        };

        if frames.is_empty() && object_function.is_none() {
            let reason = if self.has_debug_info() {
                Reason::UnknownAddr
            } else {
                Reason::DebugInfoUnavailable
            };
            return Err(reason)
        }

        let lookup = Lookup {
            frames,
            object_function,
        };
        Ok(lookup)
    }
}
