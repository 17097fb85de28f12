//! TCP transport.
//!
//! Each identity binds a socket address taken from a static directory that
//! maps transport identifiers to addresses. The dialing side opens the
//! stream with a [`HelloFrame`] carrying its own transport identifier, so
//! the accepting side learns who connected before any envelope flows.
//! After that every frame is an [`Envelope`](crate::protocol::Envelope).

pub mod codec;
mod transport;

pub use codec::{read_frame, write_frame, Frame, HelloFrame, MAX_FRAME_SIZE};
pub use transport::{TcpConfig, TcpTransport};
