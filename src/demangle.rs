//! Demangling of symbol names.
//!
//! Rust symbols (both the legacy and the v0 mangling scheme) and
//! Itanium C++ ABI symbols are supported everywhere. On Windows, MSVC
//! decorated names are additionally undecorated by the system.

#[cfg(all(windows, feature = "demangle"))]
use std::ffi::c_char;
#[cfg(all(windows, feature = "demangle"))]
use std::ffi::CStr;
#[cfg(all(windows, feature = "demangle"))]
use std::ffi::CString;


/// Check whether `name` looks like a mangled symbol name.
pub fn is_mangled(name: &str) -> bool {
    if cfg!(windows) && name.starts_with('?') {
        return true
    }

    // Mach-O symbols may carry an additional leading underscore.
    let rest = name.strip_prefix("__").or_else(|| name.strip_prefix('_'));
    matches!(rest, Some(rest) if rest.starts_with('Z') || rest.starts_with('R'))
}

#[cfg(feature = "demangle")]
fn demangle_rust(name: &str) -> Option<String> {
    rustc_demangle::try_demangle(name)
        .ok()
        .map(|demangled| format!("{demangled:#}"))
}

#[cfg(feature = "demangle")]
fn demangle_cpp(name: &str) -> Option<String> {
    cpp_demangle::Symbol::new(name)
        .ok()
        .and_then(|symbol| symbol.demangle(&Default::default()).ok())
}

#[cfg(all(windows, feature = "demangle"))]
fn undecorate(name: &str) -> Option<String> {
    #[link(name = "dbghelp")]
    extern "system" {
        fn UnDecorateSymbolName(
            name: *const c_char,
            output: *mut c_char,
            max_len: u32,
            flags: u32,
        ) -> u32;
    }

    const UNDNAME_COMPLETE: u32 = 0;

    if !name.starts_with('?') {
        return None
    }

    let name = CString::new(name).ok()?;
    let mut buffer = [0 as c_char; 1024];
    // SAFETY: `name` is NUL terminated and `buffer` is valid for the
    //         provided length.
    let len = unsafe {
        UnDecorateSymbolName(
            name.as_ptr(),
            buffer.as_mut_ptr(),
            buffer.len() as u32,
            UNDNAME_COMPLETE,
        )
    };
    if len == 0 {
        return None
    }
    // SAFETY: The function NUL terminates the output on success.
    let undecorated = unsafe { CStr::from_ptr(buffer.as_ptr()) };
    Some(undecorated.to_string_lossy().into_owned())
}

#[cfg(all(not(windows), feature = "demangle"))]
fn undecorate(_name: &str) -> Option<String> {
    None
}


/// Demangle a symbol name.
///
/// `None` is returned if `name` does not appear to be mangled or if it
/// could not be demangled. Callers are expected to fall back to the
/// original name.
#[cfg(feature = "demangle")]
pub fn demangle(name: &str) -> Option<String> {
    if !is_mangled(name) {
        return None
    }

    demangle_rust(name)
        .or_else(|| demangle_cpp(name))
        .or_else(|| undecorate(name))
}

/// Demangle a symbol name.
///
/// Without the `demangle` feature no demangling support is available and
/// `None` is always returned.
#[cfg(not(feature = "demangle"))]
pub fn demangle(_name: &str) -> Option<String> {
    None
}
