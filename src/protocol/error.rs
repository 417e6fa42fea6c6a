//! Wire protocol error.

/// An error while decoding or validating a client message frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected end of message")]
    Incomplete,
    #[error("unparsed data")]
    UnparsedData,
    #[error("message length out of range")]
    BadLength,
    #[error("unknown message type {:?}", *.0 as char)]
    UnknownTag(u8),
    #[error("unexpected message {:?} during {phase}", *.found as char)]
    Unexpected { found: u8, phase: &'static str },
    #[error("unknown header key {0:#06x}")]
    UnknownHeader(u16),
    #[error("invalid header value for key {0:#06x}")]
    BadHeaderValue(u16),
    #[error("empty query")]
    EmptyQuery,
    #[error("unknown describe mode {:?}", *.0 as char)]
    BadDescribeMode(u8),
    #[error("invalid utf-8 in message")]
    NonUtf8,
    #[error("{0}")]
    Malformed(&'static str),
}

impl ProtocolError {
    pub(crate) fn unexpected(found: u8, phase: &'static str) -> ProtocolError {
        ProtocolError::Unexpected { found, phase }
    }

    pub(crate) fn non_utf8(_: impl std::error::Error) -> ProtocolError {
        ProtocolError::NonUtf8
    }

    /// Unknown header keys surface as the binary-protocol error class.
    pub(crate) fn is_binary_protocol(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnknownHeader(_) | ProtocolError::BadHeaderValue(_)
        )
    }
}
