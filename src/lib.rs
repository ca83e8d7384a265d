#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod capture;
pub mod crash;
pub mod demangle;
mod error;
#[cfg(any(target_os = "linux", target_vendor = "apple"))]
mod image;
mod log;
pub mod module;
pub mod print;
pub mod resolve;
pub mod source;
mod util;

use std::hint::black_box;

pub use crate::capture::RawFrame;
pub use crate::capture::Trace;
pub use crate::crash::CrashConfig;
pub use crate::error::Error;
pub use crate::error::ErrorExt;
pub use crate::error::ErrorKind;
pub(crate) use crate::error::IntoError;
pub use crate::print::PrintOptions;
pub use crate::resolve::Reason;
pub use crate::resolve::ResolvedFrame;
pub use crate::resolve::ResolvedTrace;
pub use crate::resolve::Resolver;

/// A type representing addresses.
pub type Addr = usize;

/// A result type using our [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;


/// Capture the call stack of the calling thread.
///
/// The trace starts with the caller of this function and contains at
/// most `max_depth` frames.
///
/// # Errors
/// An error of kind [`ErrorKind::InvalidInput`] is reported if
/// `max_depth` is zero or larger than
/// [`MAX_CAPTURE_DEPTH`][capture::MAX_CAPTURE_DEPTH]. If the platform
/// provides no means for walking the stack, the trace is empty.
#[inline(never)]
pub fn capture_trace(max_depth: usize) -> Result<Trace> {
    black_box(capture::capture_at(capture_trace as Addr, max_depth, 0))
}

/// Resolve `trace` using the process-wide [`Resolver`].
///
/// The resolver and the debug information it loads are cached for the
/// remainder of the process' lifetime. Resolution never fails: frames
/// that could not be resolved carry a [`Reason`] instead.
pub fn resolve(trace: &Trace) -> ResolvedTrace {
    resolve::with_shared(|resolver| resolver.resolve(trace))
}

/// Render `trace` as text.
///
/// This is a shorthand for [`print::format`].
#[inline]
pub fn print(trace: &ResolvedTrace, opts: &PrintOptions) -> String {
    print::format(trace, opts)
}

/// Install the crash handler with its default configuration.
///
/// See [`crash::install`] for details.
pub fn install_crash_handler() -> Result<()> {
    crash::install(&CrashConfig::default())
}

/// Uninstall the crash handler, if installed.
///
/// See [`crash::uninstall`] for details.
pub fn uninstall_crash_handler() -> Result<()> {
    crash::uninstall()
}
