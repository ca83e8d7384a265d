use std::ffi::CStr;
use std::mem::MaybeUninit;

use crate::Addr;


/// Information about an address, as reported by the dynamic loader.
///
/// The contained strings are owned by the loader and remain valid for
/// as long as the corresponding module is loaded.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DlInfo {
    /// The path of the module containing the address.
    pub file: Option<&'static CStr>,
    /// The base address of the module.
    pub base: Addr,
    /// The name of the nearest exported symbol below the address.
    pub sym: Option<&'static CStr>,
    /// The address of `sym`.
    pub sym_addr: Addr,
}


/// Look up `addr` with the dynamic loader.
///
/// This function does not allocate. It is used on the crash reporting
/// path.
pub(crate) fn dladdr(addr: Addr) -> Option<DlInfo> {
    let mut info = MaybeUninit::<libc::Dl_info>::uninit();
    // SAFETY: `dladdr` accepts arbitrary addresses and `info` is valid
    //         for writes.
    let rc = unsafe { libc::dladdr(addr as *const _, info.as_mut_ptr()) };
    if rc == 0 {
        return None
    }
    // SAFETY: `dladdr` succeeded and initialized `info`.
    let info = unsafe { info.assume_init() };

    let cstr = |ptr: *const libc::c_char| {
        if ptr.is_null() {
            None
        } else {
            // SAFETY: Non-NULL pointers reported by `dladdr` reference
            //         NUL terminated strings owned by the loader.
            Some(unsafe { CStr::from_ptr(ptr) })
        }
    };

    let dl_info = DlInfo {
        file: cstr(info.dli_fname),
        base: info.dli_fbase as Addr,
        sym: cstr(info.dli_sname),
        sym_addr: info.dli_saddr as Addr,
    };
    Some(dl_info)
}


#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;


    /// Check that the loader knows about an exported libc function.
    #[test]
    fn libc_symbol_lookup() {
        let addr = libc::getpid as Addr;
        let info = dladdr(addr).unwrap();
        assert!(info.file.is_some());
        assert!(info.base <= addr);
        if let Some(sym) = info.sym {
            assert!(info.sym_addr <= addr);
            assert!(sym.to_str().unwrap().contains("getpid"), "{sym:?}");
        }
    }

    /// Addresses outside of any module are not known to the loader.
    #[test]
    fn unknown_address() {
        assert!(dladdr(1).is_none());
    }
}
