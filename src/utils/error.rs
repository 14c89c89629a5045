//! Error types for valkey-cluster-client

use std::io;
use thiserror::Error;

use crate::resp::ErrorReply;

/// Top-level client error
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Error reply returned by the server, surfaced through `RespValue::into_result`
    #[error("Server error: {0}")]
    Server(ErrorReply),

    #[error("Retry budget exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ClientError> },

    #[error("Too many redirects ({redirects}): {last}")]
    TooManyRedirects { redirects: u32, last: Box<ClientError> },

    #[error("Request deadline exceeded: {last}")]
    DeadlineExceeded { last: Box<ClientError> },
}

impl ClientError {
    /// Transport failures that may be retried against the same node.
    ///
    /// A reply timeout is excluded: the command may already have executed,
    /// so it is surfaced rather than replayed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Connection(e) => !matches!(e, ConnectionError::Timeout(_)),
            _ => false,
        }
    }

    /// Whether the connection that produced this error must be discarded
    pub fn poisons_connection(&self) -> bool {
        matches!(self, ClientError::Connection(_) | ClientError::Protocol(_))
    }
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Connection(ConnectionError::Io(e))
    }
}

/// Connection-related errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to {host}:{port}: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        source: io::Error,
    },

    #[error("Connection closed unexpectedly")]
    Closed,

    #[error("Connection timeout after {0}ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// RESP protocol errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid RESP type byte: {0:#04x}")]
    InvalidType(u8),

    #[error("Invalid length: {0}")]
    InvalidLength(i64),

    #[error("Malformed frame terminator")]
    InvalidTerminator,

    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Cluster-related errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error("Keys in request don't hash to the same slot: {slots:?}")]
    CrossSlot { slots: Vec<u16> },

    #[error("Slot {0} has no assigned node")]
    SlotNotOwned(u16),

    #[error("Cluster topology unavailable: {0}")]
    TopologyUnavailable(String),

    #[error("Cluster is down: {0}")]
    ClusterDown(String),

    #[error("No replica available for slot {0}")]
    NoReplicaAvailable(u16),

    #[error("Failed to parse CLUSTER NODES response: {0}")]
    ParseFailed(String),

    #[error("No primary nodes found in cluster")]
    NoPrimaries,
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_not_retryable() {
        let err = ClientError::Connection(ConnectionError::Timeout(500));
        assert!(!err.is_retryable());
        assert!(err.poisons_connection());
    }

    #[test]
    fn test_closed_is_retryable() {
        let err = ClientError::Connection(ConnectionError::Closed);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_protocol_error_poisons() {
        let err = ClientError::Protocol(ProtocolError::InvalidTerminator);
        assert!(!err.is_retryable());
        assert!(err.poisons_connection());
    }

    #[test]
    fn test_cross_slot_is_terminal() {
        let err = ClientError::Cluster(ClusterError::CrossSlot {
            slots: vec![1, 2],
        });
        assert!(!err.is_retryable());
        assert!(!err.poisons_connection());
    }
}
