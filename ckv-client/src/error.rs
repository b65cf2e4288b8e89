//! # Client Errors
//!
//! Purpose: One error taxonomy for everything a caller can observe:
//! transport failures, deadlines, server rejections, aborted transactions,
//! closed clients and bad configuration.
//!
//! ## Design Principles
//! 1. **Typed, Not Stringly**: Server rejections are classified by error code
//!    into `RequestErrorKind` so callers can match on CROSSSLOT or WRONGTYPE.
//! 2. **Context Carried**: Every variant that involves a node names it, and
//!    request failures name the command.
//! 3. **Cloneable**: I/O sources sit behind `Arc` so one refresh outcome can
//!    be handed to every coalesced awaiter.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use ckv_common::{ProtocolError, ServerError, Value};
use thiserror::Error;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Node unreachable, or its connection broke mid-request.
    #[error("connection error ({addr}): {source}")]
    Connection {
        addr: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// Deadline exceeded while waiting for a reply.
    #[error("{command} timed out after {timeout:?} on {addr}")]
    Timeout {
        command: String,
        addr: String,
        timeout: Duration,
    },

    /// Node rejected the command.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Node discarded a queued transaction.
    #[error("transaction aborted on {addr}: {message}")]
    ExecAbort { addr: String, message: String },

    /// Client is closed or closing.
    #[error("client is closed")]
    Closing,

    /// Invalid route, invalid configuration, or topology unknown.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Some nodes of a multi-node request failed.
    #[error("{} of {} nodes failed", failed.len(), failed.len() + succeeded.len())]
    PartialFailure {
        succeeded: BTreeMap<String, Value>,
        failed: BTreeMap<String, ClientError>,
    },

    /// Node sent bytes that are not valid RESP.
    #[error("protocol error from {addr}: {source}")]
    Protocol {
        addr: String,
        #[source]
        source: ProtocolError,
    },

    /// Reply type did not match what the command returns.
    #[error("unexpected response")]
    UnexpectedResponse,
}

impl ClientError {
    /// Wraps an I/O error raised while talking to `addr`.
    pub fn connection(addr: impl fmt::Display, err: io::Error) -> Self {
        ClientError::Connection {
            addr: addr.to_string(),
            source: Arc::new(err),
        }
    }

    /// Request error kind, if this is a server rejection.
    pub fn request_kind(&self) -> Option<RequestErrorKind> {
        match self {
            ClientError::Request(err) => Some(err.kind),
            _ => None,
        }
    }

    /// True for transport failures that should drop the node's connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ClientError::Connection { .. } | ClientError::Protocol { .. })
    }
}

/// Configuration and topology problems detected client-side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// No topology has been fetched yet.
    #[error("slot map not initialized")]
    NotInitialized,

    /// Address route names a host that matches no (or several) known nodes.
    #[error("address not found: {0}")]
    AddressNotFound(String),

    /// The slot is not served by any node in the current map.
    #[error("slot {0} is not covered by any node")]
    SlotNotCovered(u16),

    /// A node returned a topology the client cannot use.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Config or route rejected before any I/O.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Server error classes the client distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestErrorKind {
    /// Keys of one request (or transaction) span several slots.
    CrossSlot,
    WrongType,
    NoPerm,
    NoAuth,
    /// Slot moved to another node (only surfaced after the retry budget).
    Moved,
    /// Slot is migrating (only surfaced after the retry budget).
    Ask,
    /// Multi-key request during resharding; the caller may retry.
    TryAgain,
    Other,
}

impl RequestErrorKind {
    /// Classifies a server error by its code.
    pub fn from_code(code: &str) -> Self {
        match code {
            "CROSSSLOT" => RequestErrorKind::CrossSlot,
            "WRONGTYPE" => RequestErrorKind::WrongType,
            "NOPERM" => RequestErrorKind::NoPerm,
            "NOAUTH" => RequestErrorKind::NoAuth,
            "MOVED" => RequestErrorKind::Moved,
            "ASK" => RequestErrorKind::Ask,
            "TRYAGAIN" => RequestErrorKind::TryAgain,
            _ => RequestErrorKind::Other,
        }
    }
}

/// A command rejected by a node, or refused client-side before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestError {
    pub kind: RequestErrorKind,
    pub message: String,
    pub command: String,
    /// Node that rejected the command; `None` when refused before any I/O.
    pub node: Option<String>,
}

impl RequestError {
    /// Builds a request error from a node's error reply.
    pub fn from_server(err: &ServerError, command: impl Into<String>, node: impl fmt::Display) -> Self {
        RequestError {
            kind: RequestErrorKind::from_code(err.code()),
            message: err.message().to_string(),
            command: command.into(),
            node: Some(node.to_string()),
        }
    }

    /// Client-side CROSSSLOT rejection.
    pub fn cross_slot(command: impl Into<String>) -> Self {
        RequestError {
            kind: RequestErrorKind::CrossSlot,
            message: "CROSSSLOT Keys in request don't hash to the same slot".to_string(),
            command: command.into(),
            node: None,
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "{} failed on {}: {}", self.command, node, self.message),
            None => write!(f, "{} rejected: {}", self.command, self.message),
        }
    }
}

impl std::error::Error for RequestError {}
