//! Resolution of addresses in Mach-O modules.
//!
//! Function names come from the module's symbol table, source locations
//! from `__debug_*` sections where the image carries them. System
//! libraries living in the dyld shared cache have no file on disk; for
//! those we fall back to the symbols exported via the dynamic loader.

use crate::image::Image;
use crate::log;
use crate::module::Module;
use crate::Addr;
use crate::Error;
use crate::Reason;
use crate::Result;

use super::dladdr;
#[cfg(feature = "dwarf")]
use super::dwarf::DwarfContext;
use super::DebugSession;
use super::Lookup;
use super::Options;
use super::SymFrame;


#[derive(Debug)]
enum Source {
    /// The module's file.
    Image(Image),
    /// Exported symbols, as known to the dynamic loader.
    Loader,
}


/// A debug session for a Mach-O module.
#[derive(Debug)]
pub(crate) struct Session {
    #[cfg(feature = "dwarf")]
    dwarf: Option<DwarfContext>,
    source: Source,
    symbol_table: bool,
}

impl Session {
    #[cfg(feature = "dwarf")]
    fn find_frames(&self, addr: Addr) -> Vec<SymFrame> {
        let context = if let Some(context) = &self.dwarf {
            context
        } else {
            return Vec::new()
        };

        match context.find_frames(addr) {
            Ok(frames) => frames,
            Err(err) => {
                log::debug!("failed to look up DWARF frames for {addr:#x}: {err}");
                Vec::new()
            }
        }
    }

    #[cfg(not(feature = "dwarf"))]
    fn find_frames(&self, _addr: Addr) -> Vec<SymFrame> {
        Vec::new()
    }
}

impl DebugSession for Session {
    fn open(module: &Module, opts: &Options) -> Result<Self> {
        if !opts.symbol_table && !opts.debug_info {
            return Err(Error::with_unsupported(
                "neither symbol tables nor debug information are enabled",
            ))
        }

        let source = match Image::open(module.file()) {
            Ok(image) => Source::Image(image),
            Err(err) => {
                log::debug!(
                    "failed to parse {}: {err}; using exported symbols",
                    module.path.display()
                );
                Source::Loader
            }
        };

        #[cfg(feature = "dwarf")]
        let dwarf = match &source {
            Source::Image(image) if opts.debug_info && image.has_dwarf() => {
                match DwarfContext::load(image) {
                    Ok(context) => Some(context),
                    Err(err) => {
                        log::warn!(
                            "failed to load DWARF information of {}: {err}",
                            module.path.display()
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        let slf = Self {
            #[cfg(feature = "dwarf")]
            dwarf,
            source,
            symbol_table: opts.symbol_table,
        };
        Ok(slf)
    }

    fn lookup(&self, module: &Module, addr: Addr) -> Result<Lookup, Reason> {
        let (frames, name) = match &self.source {
            Source::Image(image) => {
                let offset = module.file_offset(addr).ok_or(Reason::UnknownAddr)?;
                let virt_addr = image.find_virt_addr(offset).ok_or(Reason::UnknownAddr)?;
                let frames = self.find_frames(virt_addr);
                let name = if self.symbol_table {
                    match image.find_sym(virt_addr) {
                        Ok((name, _addr)) => Some(name.to_string()),
                        Err(reason) if frames.is_empty() => return Err(reason),
                        Err(_) => None,
                    }
                } else {
                    None
                };
                (frames, name)
            }
            Source::Loader if self.symbol_table => {
                let info = dladdr(addr).ok_or(Reason::UnknownAddr)?;
                let sym = info.sym.ok_or(Reason::MissingSymbols)?;
                (Vec::new(), Some(sym.to_string_lossy().into_owned()))
            }
            Source::Loader => return Err(Reason::DebugInfoUnavailable),
        };

        let frames = match (frames.is_empty(), &name) {
            (false, _) => frames,
            (true, Some(name)) => vec![SymFrame {
                name: Some(name.clone()),
                ..Default::default()
            }],
            (true, None) => return Err(Reason::DebugInfoUnavailable),
        };

        let lookup = Lookup {
            frames,
            object_function: name,
        };
        Ok(lookup)
    }
}
