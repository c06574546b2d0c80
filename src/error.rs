use core::fmt;
use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The class of failure, which decides how far an error propagates.
///
/// Only [`ErrorKind::Device`] aborts a run. Everything else is reported against the file it
/// concerns and the run continues with the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The input image is unreadable, malformed, or uses unsupported features.
    Input,
    /// The image needs more compute units than the whole pool provides.
    Capacity,
    /// The output file could not be created or written.
    Output,
    /// A device pool operation (program load, transfer, execution) failed.
    Device,
}

pub struct Error {
    kind: ErrorKind,
    repr: Repr,
}

pub(crate) enum Repr {
    Other(String),
    Io(io::Error),
}

impl From<String> for Repr {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}
impl<'a> From<&'a str> for Repr {
    fn from(value: &'a str) -> Self {
        Self::Other(value.into())
    }
}
impl From<io::Error> for Repr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl Error {
    /// Creates an [`ErrorKind::Input`] error.
    pub(crate) fn from(e: impl Into<Repr>) -> Self {
        Self::new(ErrorKind::Input, e)
    }

    pub(crate) fn new(kind: ErrorKind, e: impl Into<Repr>) -> Self {
        Self {
            kind,
            repr: e.into(),
        }
    }

    pub(crate) fn capacity(e: impl Into<Repr>) -> Self {
        Self::new(ErrorKind::Capacity, e)
    }

    pub(crate) fn output(e: impl Into<Repr>) -> Self {
        Self::new(ErrorKind::Output, e)
    }

    pub(crate) fn device(e: impl Into<Repr>) -> Self {
        Self::new(ErrorKind::Device, e)
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns whether this error must abort the whole run.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Device
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Other(s) => write!(f, "{:?}: {}", self.kind, s),
            Repr::Io(e) => write!(f, "{:?}: {:?}", self.kind, e),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Other(s) => s.fmt(f),
            Repr::Io(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.repr {
            Repr::Other(_) => None,
            Repr::Io(e) => Some(e),
        }
    }
}
