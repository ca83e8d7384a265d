use crate::Addr;
use crate::Error;
use crate::Result;

use super::CrashConfig;


pub(super) fn emit(_bytes: &[u8]) {}

pub(super) fn module_name(_addr: Addr) -> Option<&'static [u8]> {
    None
}


pub(super) struct Installation(());

impl Installation {
    pub(super) fn new(_config: &CrashConfig) -> Result<Self> {
        Err(Error::with_unsupported(
            "crash handling is not supported on this platform",
        ))
    }

    pub(super) fn uninstall(self) -> Result<()> {
        Ok(())
    }
}
