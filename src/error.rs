use thiserror::Error;

use crate::protocol::RemoteError;

/// Errors that can occur during RPC operations
#[derive(Error, Debug)]
pub enum RpcError {
    /// Topology setup failed (connect, exchange/queue declaration, binding, QoS).
    ///
    /// The connection is unusable; the caller decides whether to abort or retry.
    #[error("setup error: {0}")]
    Setup(String),

    /// Broker interaction failed after setup (publish, consume, ack).
    #[error("transport error: {0}")]
    Transport(String),

    /// Request timed out waiting for response
    #[error("request timed out")]
    Timeout,

    /// A reply reached a waiter carrying somebody else's correlation token.
    #[error("INVALID_CORRELATION_ID: expected {expected}, received {received}")]
    InvalidCorrelationId { expected: String, received: String },

    /// The remote handler reported an error.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    /// A response envelope did not follow the wire format.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation not allowed on a connection of this role.
    #[error("invalid role: {0}")]
    InvalidRole(String),

    /// `serve` was called while the server was already serving or after
    /// it shut down.
    #[error("server is not idle")]
    NotIdle,

    /// Configuration is missing or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        RpcError::Remote(err)
    }
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;
