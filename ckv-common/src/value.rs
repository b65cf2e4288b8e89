//! # Reply Values
//!
//! Purpose: Represent every reply shape a node can send under RESP2 or RESP3
//! as one owned tree, so the client core never touches raw bytes.
//!
//! ## Design Principles
//! 1. **One Type, Two Protocols**: RESP2 replies use a subset of the variants;
//!    RESP3 adds maps, sets, doubles, booleans and friends.
//! 2. **Errors Are Values**: A server error reply is data until the client
//!    decides how to classify it (redirect, CROSSSLOT, plain failure).
//! 3. **Binary-Safe**: Bulk payloads stay as `Bytes`.

use std::fmt;

use bytes::Bytes;

/// Error reply sent by a node (`-ERR ...` or RESP3 `!` blob error).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    message: String,
}

impl ServerError {
    /// Wraps the message text, without the leading `-` and trailing CRLF.
    pub fn new(message: impl Into<String>) -> Self {
        ServerError {
            message: message.into(),
        }
    }

    /// Error code, i.e. the first word (`ERR`, `MOVED`, `CROSSSLOT`, ...).
    pub fn code(&self) -> &str {
        self.message.split_whitespace().next().unwrap_or("")
    }

    /// Text after the error code.
    pub fn detail(&self) -> &str {
        let trimmed = self.message.trim_start();
        match trimmed.find(char::is_whitespace) {
            Some(idx) => trimmed[idx..].trim(),
            None => "",
        }
    }

    /// Full message as sent by the node.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// RESP2 null bulk/array or RESP3 `_`.
    Nil,
    /// `:123`
    Int(i64),
    /// `$...` bulk string.
    BulkString(Bytes),
    /// `+OK` style status reply.
    SimpleString(String),
    /// `*...` array.
    Array(Vec<Value>),
    /// RESP3 `%` map, kept in wire order.
    Map(Vec<(Value, Value)>),
    /// RESP3 `~` set.
    Set(Vec<Value>),
    /// RESP3 `,` double.
    Double(f64),
    /// RESP3 `#` boolean.
    Boolean(bool),
    /// RESP3 `=` verbatim string with its three-letter format.
    VerbatimString { format: String, text: String },
    /// RESP3 `(` big number, kept as its decimal text.
    BigNumber(String),
    /// RESP3 `>` out-of-band push message.
    Push { kind: String, data: Vec<Value> },
    /// `-ERR ...` or RESP3 `!` error.
    ServerError(ServerError),
}

impl Value {
    /// True for `+OK`.
    pub fn is_ok(&self) -> bool {
        matches!(self, Value::SimpleString(s) if s == "OK")
    }

    /// Returns the server error if this value is one.
    pub fn as_server_error(&self) -> Option<&ServerError> {
        match self {
            Value::ServerError(err) => Some(err),
            _ => None,
        }
    }

    /// Integer view for `Int` replies.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Byte view for string-like replies.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::BulkString(data) => Some(data),
            Value::SimpleString(text) => Some(text.as_bytes()),
            Value::VerbatimString { text, .. } => Some(text.as_bytes()),
            _ => None,
        }
    }

    /// Consumes the value and returns its elements when it is an aggregate.
    ///
    /// Maps are flattened to `k1, v1, k2, v2, ...` as RESP2 would send them.
    pub fn into_sequence(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) | Value::Set(items) => Some(items),
            Value::Map(pairs) => Some(
                pairs
                    .into_iter()
                    .flat_map(|(k, v)| [k, v])
                    .collect(),
            ),
            _ => None,
        }
    }
}

impl From<ServerError> for Value {
    fn from(err: ServerError) -> Self {
        Value::ServerError(err)
    }
}
