//! Error handling for the crate.
//!
//! Most conditions encountered while capturing, resolving, or printing a
//! trace are not errors at all: they degrade individual fields of a frame
//! and are reported as a [`Reason`][crate::Reason]. The [`Error`] type
//! defined here is reserved for the few cases in which an operation cannot
//! proceed at all.

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::io;


/// An enumeration of the broad categories of errors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An entity was not found, often a file.
    NotFound,
    /// The operation lacked the necessary privileges to complete.
    PermissionDenied,
    /// An entity already exists.
    AlreadyExists,
    /// A parameter was incorrect.
    InvalidInput,
    /// Data not valid for the operation were encountered.
    InvalidData,
    /// This operation is unsupported on this platform.
    Unsupported,
    /// An error returned when an operation could not be completed because an
    /// "end of file" was reached prematurely.
    UnexpectedEof,
    /// An operation could not be completed, because it failed
    /// to allocate enough memory.
    OutOfMemory,
    /// A custom error that does not fall under any other error kind.
    Other,
}

impl ErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "entity not found",
            Self::PermissionDenied => "permission denied",
            Self::AlreadyExists => "entity already exists",
            Self::InvalidInput => "invalid input parameter",
            Self::InvalidData => "invalid data",
            Self::Unsupported => "unsupported",
            Self::UnexpectedEof => "unexpected end of file",
            Self::OutOfMemory => "out of memory",
            Self::Other => "other error",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl From<io::ErrorKind> for ErrorKind {
    fn from(other: io::ErrorKind) -> Self {
        match other {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            io::ErrorKind::InvalidInput => Self::InvalidInput,
            io::ErrorKind::InvalidData => Self::InvalidData,
            io::ErrorKind::Unsupported => Self::Unsupported,
            io::ErrorKind::UnexpectedEof => Self::UnexpectedEof,
            io::ErrorKind::OutOfMemory => Self::OutOfMemory,
            _ => Self::Other,
        }
    }
}


#[derive(Debug, thiserror::Error)]
enum Repr {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[cfg(feature = "dwarf")]
    #[error("failed to parse DWARF debug information: {0}")]
    Dwarf(gimli::Error),
    #[error("failed to parse object file: {0}")]
    Object(object::Error),
    #[error("{message}")]
    Custom {
        kind: ErrorKind,
        message: Cow<'static, str>,
    },
}


/// The error type used by the crate.
///
/// An error carries an [`ErrorKind`] along with a stack of context
/// messages, added via [`ErrorExt::context`] and
/// [`ErrorExt::with_context`], the most recent one being displayed first.
pub struct Error {
    repr: Repr,
    context: Vec<Cow<'static, str>>,
}

macro_rules! ctor {
    ($name:ident, $kind:ident) => {
        #[doc = concat!("Create a new [`Error`] of kind [`ErrorKind::", stringify!($kind), "`].")]
        pub fn $name<E>(error: E) -> Self
        where
            E: ToString,
        {
            Self::new(ErrorKind::$kind, error.to_string())
        }
    };
}

impl Error {
    fn new<M>(kind: ErrorKind, message: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        Self {
            repr: Repr::Custom {
                kind,
                message: message.into(),
            },
            context: Vec::new(),
        }
    }

    ctor!(with_not_found, NotFound);
    ctor!(with_already_exists, AlreadyExists);
    ctor!(with_invalid_input, InvalidInput);
    ctor!(with_invalid_data, InvalidData);
    ctor!(with_unsupported, Unsupported);
    ctor!(with_out_of_memory, OutOfMemory);

    /// Retrieve the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match &self.repr {
            Repr::Io(err) => err.kind().into(),
            #[cfg(feature = "dwarf")]
            Repr::Dwarf(..) => ErrorKind::InvalidData,
            Repr::Object(..) => ErrorKind::InvalidData,
            Repr::Custom { kind, .. } => *kind,
        }
    }

    fn layer_context(mut self, context: Cow<'static, str>) -> Self {
        let () = self.context.push(context);
        self
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Error")
            .field("kind", &self.kind())
            .field("repr", &self.repr)
            .field("context", &self.context)
            .finish()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        for context in self.context.iter().rev() {
            write!(f, "{context}: ")?;
        }
        Display::fmt(&self.repr, f)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &self.repr {
            Repr::Io(err) => Some(err),
            #[cfg(feature = "dwarf")]
            Repr::Dwarf(err) => Some(err),
            Repr::Object(err) => Some(err),
            Repr::Custom { .. } => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(other: io::Error) -> Self {
        Self {
            repr: Repr::Io(other),
            context: Vec::new(),
        }
    }
}

#[cfg(feature = "dwarf")]
impl From<gimli::Error> for Error {
    fn from(other: gimli::Error) -> Self {
        Self {
            repr: Repr::Dwarf(other),
            context: Vec::new(),
        }
    }
}

impl From<object::Error> for Error {
    fn from(other: object::Error) -> Self {
        Self {
            repr: Repr::Object(other),
            context: Vec::new(),
        }
    }
}


/// A trait providing ergonomic chaining capabilities to [`Error`].
pub trait ErrorExt: private::Sealed {
    /// The output type produced by [`context`](Self::context) and
    /// [`with_context`](Self::with_context).
    type Output;

    /// Add context to this error.
    fn context<C>(self, context: C) -> Self::Output
    where
        C: Into<Cow<'static, str>>;

    /// Add context to this error, using a closure for lazy evaluation.
    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce() -> C;
}

impl ErrorExt for Error {
    type Output = Error;

    fn context<C>(self, context: C) -> Self::Output
    where
        C: Into<Cow<'static, str>>,
    {
        self.layer_context(context.into())
    }

    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce() -> C,
    {
        self.layer_context(f().into())
    }
}

impl<T, E> ErrorExt for Result<T, E>
where
    E: Into<Error>,
{
    type Output = Result<T, Error>;

    fn context<C>(self, context: C) -> Self::Output
    where
        C: Into<Cow<'static, str>>,
    {
        self.map_err(|err| err.into().context(context))
    }

    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce() -> C,
    {
        self.map_err(|err| err.into().with_context(f))
    }
}


/// A trait to make an `Option` into a `Result` with an [`Error`] of a
/// specific kind.
pub(crate) trait IntoError<T> {
    fn ok_or_invalid_data<M, F>(self, f: F) -> Result<T, Error>
    where
        M: ToString,
        F: FnOnce() -> M;
}

impl<T> IntoError<T> for Option<T> {
    #[inline]
    fn ok_or_invalid_data<M, F>(self, f: F) -> Result<T, Error>
    where
        M: ToString,
        F: FnOnce() -> M,
    {
        self.ok_or_else(|| Error::with_invalid_data(f()))
    }
}


mod private {
    use super::Error;

    pub trait Sealed {}

    impl Sealed for Error {}
    impl<T, E> Sealed for Result<T, E> {}
}
