//! Internal logging macros.
//!
//! With the `tracing` feature enabled, the macros forward to their
//! `tracing` counterparts. Otherwise they expand to nothing, while still
//! type checking their arguments.

#[cfg(feature = "tracing")]
macro_rules! trace {
    ($($args:tt)*) => { tracing::trace!($($args)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace {
    ($($args:tt)*) => {{
        if false {
            let _args = format!($($args)*);
        }
    }};
}

#[cfg(feature = "tracing")]
macro_rules! debug {
    ($($args:tt)*) => { tracing::debug!($($args)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug {
    ($($args:tt)*) => {{
        if false {
            let _args = format!($($args)*);
        }
    }};
}

#[cfg(feature = "tracing")]
macro_rules! warn_ {
    ($($args:tt)*) => { tracing::warn!($($args)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_ {
    ($($args:tt)*) => {{
        if false {
            let _args = format!($($args)*);
        }
    }};
}

pub(crate) use debug;
pub(crate) use trace;
// A plain `use warn` would be ambiguous with the built-in attribute.
pub(crate) use warn_ as warn;
