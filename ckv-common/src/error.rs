//! Protocol error types for RESP2/RESP3 parsing.

use thiserror::Error;

/// Result type for codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised when bytes received from a node are not valid RESP.
///
/// An incomplete frame is not an error: the parser reports it as `Ok(None)`
/// and the caller reads more data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The first byte of a frame didn't match any known type prefix.
    #[error("invalid type prefix: {0:#04x}")]
    InvalidPrefix(u8),

    /// Failed to parse an integer from the frame header or body.
    #[error("invalid integer encoding")]
    InvalidInteger,

    /// Failed to parse a RESP3 double.
    #[error("invalid double encoding")]
    InvalidDouble,

    /// A RESP3 boolean was neither `t` nor `f`.
    #[error("invalid boolean encoding")]
    InvalidBoolean,

    /// A bulk string or aggregate declared a negative length other than -1.
    #[error("invalid frame length: {0}")]
    InvalidLength(i64),

    /// A bulk payload was not followed by CRLF.
    #[error("missing CRLF terminator")]
    MissingCrlf,

    /// A simple string or error line was not valid UTF-8.
    #[error("invalid utf-8 in simple frame")]
    InvalidUtf8,

    /// Frame kind is valid RESP but not handled by this codec.
    #[error("unsupported frame: {0}")]
    Unsupported(&'static str),
}
