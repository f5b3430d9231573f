//! Error types for the DHT core.
//!
//! Per-peer I/O failures during queries are carried inside
//! [`QueryEvent::QueryError`](crate::network::QueryEvent) and never abort a
//! running query; only startup failures and aborts surface to callers.

use thiserror::Error;

/// Errors produced by DHT operations.
#[derive(Debug, Clone, Error)]
pub enum DhtError {
    /// A record failed validation for its namespace.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A stream closed before a reply frame arrived.
    #[error("no message received")]
    NoMessageReceived,

    /// An operation exceeded its deadline.
    #[error("timed out")]
    Timeout,

    /// The caller's abort signal fired. Not a failure.
    #[error("aborted")]
    Aborted,

    /// The peer could not be dialed.
    #[error("dial failed: {0}")]
    DialFailed(String),

    /// The remote reset the stream mid-exchange.
    #[error("stream reset")]
    StreamReset,

    /// The remote does not speak the requested protocol.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// An operation ran before `start()` populated the routing table plumbing.
    #[error("routing table not initialized")]
    TableNotInitialized,

    /// The datastore or an in-memory bound rejected a write.
    #[error("store full")]
    StoreFull,

    /// A lookup exhausted every path without a result.
    #[error("not found")]
    NotFound,

    /// Wire-format decode failure on a received frame.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Datastore backend failure.
    #[error("datastore: {0}")]
    Datastore(String),

    /// The node was assembled without a required collaborator.
    #[error("configuration: {0}")]
    Config(String),

    /// Catch-all for transport-level I/O errors.
    #[error("io: {0}")]
    Io(String),
}

impl DhtError {
    /// Whether the error came from the caller cancelling, as opposed to the
    /// network or a peer misbehaving.
    pub fn is_aborted(&self) -> bool {
        matches!(self, DhtError::Aborted)
    }
}

impl From<std::io::Error> for DhtError {
    fn from(e: std::io::Error) -> Self {
        DhtError::Io(e.to_string())
    }
}

impl From<prost::DecodeError> for DhtError {
    fn from(e: prost::DecodeError) -> Self {
        DhtError::MalformedMessage(e.to_string())
    }
}
