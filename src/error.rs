//! `quel` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{caps::Capability, protocol::ProtocolError};

/// A specialized [`Result`] type for `quel` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from the `quel` server core.
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

    /// Stable wire code reported in `ErrorResponse` frames.
    pub fn code(&self) -> u32 {
        self.kind.code()
    }

    /// Message as sent to the client, without the backtrace.
    pub fn wire_message(&self) -> String {
        if self.context.is_empty() {
            self.kind.to_string()
        } else {
            format!("{}: {}", self.context, self.kind)
        }
    }

    /// Errors after which the connection cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Io(_) | ErrorKind::ConnectionAborted)
    }

    pub(crate) fn context(mut self, context: impl Into<String>) -> Error {
        self.context = context.into();
        self
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Error {
        ErrorKind::UnsupportedFeature(message.into()).into()
    }

    pub(crate) fn authentication(message: impl Into<String>) -> Error {
        ErrorKind::Authentication(message.into()).into()
    }

    pub(crate) fn access(message: impl Into<String>) -> Error {
        ErrorKind::Access(message.into()).into()
    }

    pub(crate) fn transaction(message: impl Into<String>) -> Error {
        ErrorKind::Transaction(message.into()).into()
    }

    pub(crate) fn disabled_capability(disabled: Capability) -> Error {
        ErrorKind::DisabledCapability { disabled }.into()
    }

    pub(crate) fn type_spec_not_found() -> Error {
        ErrorKind::TypeSpecNotFound.into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal(message.into()).into()
    }

    pub(crate) fn aborted() -> Error {
        ErrorKind::ConnectionAborted.into()
    }
}

/// An error reported by the backend SQL driver.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    /// True when the backend rolled its transaction back on its own,
    /// e.g. a failed `COMMIT`.
    pub left_transaction: bool,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> BackendError {
        BackendError { message: message.into(), left_transaction: false }
    }
}

/// All possible error kind from the `quel` server core.
pub enum ErrorKind {
    Protocol(ProtocolError),
    UnsupportedFeature(String),
    Authentication(String),
    Access(String),
    DisabledCapability { disabled: Capability },
    TypeSpecNotFound,
    Transaction(String),
    Backend(BackendError),
    BackendCancelled,
    ConnectionAborted,
    Io(io::Error),
    Internal(String),
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            ErrorKind::Internal(_) => 0x0100_0000,
            ErrorKind::UnsupportedFeature(_) => 0x0200_0100,
            ErrorKind::Protocol(e) if e.is_binary_protocol() => 0x0300_0100,
            ErrorKind::Protocol(_) => 0x0300_0000,
            ErrorKind::TypeSpecNotFound => 0x0300_0200,
            ErrorKind::DisabledCapability { .. } => 0x0300_0300,
            ErrorKind::Authentication(_) => 0x0400_0000,
            ErrorKind::Access(_) => 0x0400_0100,
            ErrorKind::Transaction(_) => 0x0500_0000,
            ErrorKind::Backend(_) => 0x0600_0000,
            ErrorKind::BackendCancelled => 0x0600_0100,
            ErrorKind::ConnectionAborted => 0x0700_0000,
            ErrorKind::Io(_) => 0x0700_0100,
        }
    }
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
from!(<BackendError>e => ErrorKind::Backend(e));
from!(<io::Error>e => ErrorKind::Io(e));

impl std::error::Error for Error {}

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

impl std::error::Error for ErrorKind {}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "{e}"),
            Self::UnsupportedFeature(m) => write!(f, "{m}"),
            Self::Authentication(m) => write!(f, "authentication failed: {m}"),
            Self::Access(m) => write!(f, "{m}"),
            Self::DisabledCapability { disabled } => {
                write!(f, "query requires disabled capabilities: {disabled}")
            }
            Self::TypeSpecNotFound => write!(f, "no type description available"),
            Self::Transaction(m) => write!(f, "{m}"),
            Self::Backend(e) => write!(f, "{e}"),
            Self::BackendCancelled => write!(f, "query was cancelled by the backend"),
            Self::ConnectionAborted => write!(f, "connection aborted"),
            Self::Io(e) => write!(f, "{e}"),
            Self::Internal(m) => write!(f, "internal server error: {m}"),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
