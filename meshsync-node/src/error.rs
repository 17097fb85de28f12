//! Error types for the mesh layer.

use crate::link::LinkState;
use meshsync_types::Identity;
use thiserror::Error;

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;

/// Errors that can occur in mesh operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeshError {
    /// Empty or malformed identity, key or event type, or an operation that
    /// requires an open node.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An open is already in flight.
    #[error("node is already opening")]
    AlreadyOpening,

    /// The transport refused to bind the local identity.
    #[error("transport bind failed: {0}")]
    TransportBindFailed(String),

    /// The link failed before the handshake completed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// No open link to the named identity.
    #[error("not connected to {0}")]
    NotConnected(Identity),

    /// Send on a closed link.
    #[error("link closed")]
    LinkClosed,

    /// The node or link was closed while the operation was pending.
    #[error("closed before completion")]
    ClosedBeforeCompletion,

    /// Link state machine violation.
    #[error("invalid link transition from {from:?} to {to:?}")]
    InvalidTransition { from: LinkState, to: LinkState },

    /// Transport-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed or unexpected frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The node's event loop has stopped.
    #[error("channel closed")]
    ChannelClosed,
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<meshsync_types::Error> for MeshError {
    fn from(e: meshsync_types::Error) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}
