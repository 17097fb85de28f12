//! Mesh synchronization for meshsync.
//!
//! A node claims a unique identity on a transport, forms links with other
//! identities, and keeps two things consistent across everything it is
//! linked to, directly or through other nodes:
//!
//! - a shared key/value store, replicated last-writer-wins by arrival
//! - a stream of broadcast events, relayed with duplicate suppression
//!
//! # Architecture
//!
//! - **Protocol**: the four envelope kinds exchanged over a link
//! - **Store**: the variable map and the bounded seen-event history
//! - **Link**: per-connection state machine
//! - **Transport**: abstracts over in-process and TCP connections
//! - **Node**: the event loop that owns all of the above
//!
//! ## Link lifecycle
//!
//! 1. **Request**: an outbound connect starts, or an inbound connection arrives
//! 2. **Open**: the transport reports the channel usable
//! 3. **Handshake**: the responder sends its snapshot, the initiator merges
//!    and answers with the union
//! 4. **Replicate**: variable updates and events flow and are relayed
//!
//! # Example
//!
//! ```no_run
//! use meshsync_node::{MemoryNetwork, MeshConfig, MeshNode};
//! use std::sync::Arc;
//!
//! # async fn demo() -> meshsync_node::MeshResult<()> {
//! let network = MemoryNetwork::new();
//! let a = MeshNode::new(Arc::new(network.transport()), MeshConfig::default());
//! let b = MeshNode::new(Arc::new(network.transport()), MeshConfig::default());
//!
//! a.open("alice").await?;
//! b.open("bob").await?;
//! a.connect("bob").await?;
//! a.set_var("color", "blue").await?;
//! # Ok(())
//! # }
//! ```

mod error;
pub mod lifecycle;
pub mod link;
mod node;
pub mod protocol;
pub mod store;
pub mod tcp;
pub mod transport;

pub use error::{MeshError, MeshResult};
pub use lifecycle::{ListenerRegistry, MeshNotification, SubscriptionId};
pub use link::{Link, LinkId, LinkInfo, LinkRole, LinkState};
pub use node::{MeshConfig, MeshNode};
pub use protocol::{
    Envelope, EventKey, EventMessage, SnapshotMessage, VarPair, VarUpdateMessage,
    PROTOCOL_VERSION,
};
pub use store::{SeenEvents, VarStore, DEFAULT_DEDUP_CAPACITY};
pub use tcp::{TcpConfig, TcpTransport};
pub use transport::memory::{MemoryNetwork, MemoryTransport};
pub use transport::{Binding, Connection, ConnectionEvent, LinkSink, MeshTransport};

pub use meshsync_types::{Identity, IdentityCodec, NamespaceCodec};
