//! `pgriver` error types.
use std::{backtrace::Backtrace, fmt, io, str::Utf8Error};

use crate::{
    encode::EncodeError,
    postgres::ProtocolError,
    result::ErrorResult,
};

/// A specialized [`Result`] type for `pgriver` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pgriver` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub(crate) fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            backtrace: Backtrace::capture(),
            kind,
        }
    }
}

/// All possible error kind from `pgriver` library.
pub enum ErrorKind {
    /// Backend traffic that does not decode or arrives out of phase.
    ///
    /// Connection fatal, the session must be discarded.
    Protocol(ProtocolError),
    /// Transport failure. Connection fatal.
    Io(io::Error),
    /// A parameter slot that cannot be encoded. The session stays usable.
    Encode(EncodeError),
    /// A statement level failure raised as an error by a completion
    /// wrapper, see [`Session::run`][crate::Session::run].
    Statement(ErrorResult),
    Utf8(Utf8Error),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<std::io::Error>e => ErrorKind::Io(e));
from!(<EncodeError>e => ErrorKind::Encode(e));
from!(<ErrorResult>e => ErrorKind::Statement(e));
from!(<Utf8Error>e => ErrorKind::Utf8(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Encode(e) => e.fmt(f),
            Self::Statement(e) => e.fmt(f),
            Self::Utf8(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
