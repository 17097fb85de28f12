//! Transport layer abstraction.
//!
//! The node needs very little from a transport: bind a local identifier,
//! accept inbound connections, dial a remote identifier, and for each
//! connection a way to send envelopes plus a stream of notifications.
//! Connection negotiation, NAT traversal and rendezvous are the
//! transport's business.

use crate::error::MeshResult;
use crate::protocol::Envelope;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod memory;

/// Notification from one transport connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The channel is usable.
    Opened,
    /// An envelope arrived.
    Data(Envelope),
    /// The remote side closed the channel.
    Closed,
    /// The channel failed.
    Error(String),
}

/// Sending half of a connection.
pub trait LinkSink: Send + Sync {
    /// Queues an envelope for delivery. Fails once the connection is closed.
    fn send(&self, envelope: &Envelope) -> MeshResult<()>;

    /// Closes the connection. Idempotent.
    fn close(&self);
}

/// A connection handed to the node by the transport.
pub struct Connection {
    /// Transport identifier of the remote end.
    pub remote: String,
    /// Sending half.
    pub sink: Box<dyn LinkSink>,
    /// Notifications, starting with [`ConnectionEvent::Opened`].
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// A bound local identifier.
#[derive(Debug)]
pub struct Binding {
    /// The identifier the transport confirmed.
    pub local: String,
    /// Inbound connections, in arrival order.
    pub incoming: mpsc::UnboundedReceiver<Connection>,
}

/// A transport that can bind identifiers and connect them.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Binds the local identifier and starts accepting connections.
    async fn bind(&self, transport_id: &str) -> MeshResult<Binding>;

    /// Opens a connection from `local` to `remote`.
    async fn dial(&self, local: &str, remote: &str) -> MeshResult<Connection>;

    /// Releases a binding. Connections already established are unaffected.
    fn unbind(&self, transport_id: &str);

    /// Whether the identifier is currently bound by this transport.
    fn is_bound(&self, transport_id: &str) -> bool;
}
