//! Core type definitions for meshsync.
//!
//! This crate defines the small set of types shared by every mesh component:
//! - Mesh identities (opaque, user-chosen strings)
//! - The identity codec boundary mapping identities onto transport identifiers
//! - Per-node logical timestamps
//!
//! Protocol envelopes, links and the node itself live in `meshsync-node`.

mod codec;
mod ids;
mod timestamp;

pub use codec::{IdentityCodec, NamespaceCodec, DEFAULT_NAMESPACE};
pub use ids::Identity;
pub use timestamp::{LogicalClock, Timestamp};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid transport id: {0}")]
    InvalidTransportId(String),
}
