//! Fallback resolution for platforms without a dedicated backend: the
//! nearest exported symbol, as far as the dynamic loader knows it.

use crate::module::Module;
use crate::Addr;
use crate::Error;
use crate::Reason;
use crate::Result;

#[cfg(unix)]
use super::dladdr;
use super::DebugSession;
use super::Lookup;
use super::Options;
use super::SymFrame;


#[derive(Debug)]
pub(crate) struct Session(());

impl DebugSession for Session {
    fn open(_module: &Module, opts: &Options) -> Result<Self> {
        if !cfg!(unix) || !opts.symbol_table {
            return Err(Error::with_unsupported(
                "no symbol source is available on this platform",
            ))
        }
        Ok(Self(()))
    }

    #[cfg(unix)]
    fn lookup(&self, _module: &Module, addr: Addr) -> Result<Lookup, Reason> {
        let info = dladdr(addr).ok_or(Reason::UnknownAddr)?;
        let name = info
            .sym
            .ok_or(Reason::MissingSymbols)?
            .to_string_lossy()
            .into_owned();

        let lookup = Lookup {
            frames: vec![SymFrame {
                name: Some(name.clone()),
                ..Default::default()
            }],
            object_function: Some(name),
        };
        Ok(lookup)
    }

    #[cfg(not(unix))]
    fn lookup(&self, _module: &Module, _addr: Addr) -> Result<Lookup, Reason> {
        Err(Reason::DebugInfoUnavailable)
    }
}
