//! Links to remote nodes.
//!
//! A link wraps one transport connection and owns its state machine:
//!
//! ```text
//! Opening ──▶ Handshaking ──▶ Open ──▶ Closed
//!    │             │            │
//!    └─────────────┴────────────┴────▶ Error
//! ```
//!
//! `Opening` and `Handshaking` may also go straight to `Closed`.

use crate::error::{MeshError, MeshResult};
use crate::protocol::{Envelope, EventMessage, VarPair};
use crate::transport::LinkSink;
use meshsync_types::Identity;
use serde::Serialize;
use std::fmt;

/// State of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkState {
    /// Connection handed over, nothing exchanged yet.
    Opening,
    /// Channel usable, handshake in flight.
    Handshaking,
    /// Handshake done, replication traffic flows.
    Open,
    /// Closed by either side.
    Closed,
    /// Failed.
    Error,
}

impl LinkState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Opening, Handshaking)
                | (Opening, Closed)
                | (Opening, Error)
                | (Handshaking, Open)
                | (Handshaking, Closed)
                | (Handshaking, Error)
                | (Open, Closed)
                | (Open, Error)
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Opening => "opening",
            Self::Handshaking => "handshaking",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Error => "error",
        })
    }
}

/// Which side created the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkRole {
    /// We dialed.
    Initiator,
    /// We accepted.
    Responder,
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initiator => "initiator",
            Self::Responder => "responder",
        })
    }
}

/// Node-local serial number of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LinkId(u64);

impl LinkId {
    /// Wraps a raw serial number.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw serial number.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Read-only view of a link, handed to callers and listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkInfo {
    pub id: LinkId,
    pub remote: Identity,
    pub role: LinkRole,
    pub state: LinkState,
}

/// A connection to one remote identity.
pub struct Link {
    id: LinkId,
    remote: Identity,
    role: LinkRole,
    state: LinkState,
    /// Variables exchanged during the handshake, in either direction.
    snapshot: Vec<VarPair>,
    last_event: Option<EventMessage>,
    sink: Box<dyn LinkSink>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("snapshot_len", &self.snapshot.len())
            .finish_non_exhaustive()
    }
}

impl Link {
    /// Creates a link in the `Opening` state.
    pub fn new(id: LinkId, remote: Identity, role: LinkRole, sink: Box<dyn LinkSink>) -> Self {
        Self {
            id,
            remote,
            role,
            state: LinkState::Opening,
            snapshot: Vec::new(),
            last_event: None,
            sink,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn remote(&self) -> &Identity {
        &self.remote
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    /// The variables exchanged during the handshake.
    pub fn snapshot(&self) -> &[VarPair] {
        &self.snapshot
    }

    /// Whether the remote saw `pair` during the handshake.
    pub fn covers(&self, pair: &VarPair) -> bool {
        self.snapshot.contains(pair)
    }

    /// The last event envelope received on this link.
    pub fn last_event(&self) -> Option<&EventMessage> {
        self.last_event.as_ref()
    }

    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            id: self.id,
            remote: self.remote.clone(),
            role: self.role,
            state: self.state,
        }
    }

    /// The identity that started this link, given our own.
    pub fn initiator<'a>(&'a self, local: &'a Identity) -> &'a Identity {
        match self.role {
            LinkRole::Initiator => local,
            LinkRole::Responder => &self.remote,
        }
    }

    /// Moves to `next`, returning the previous state.
    pub fn transition(&mut self, next: LinkState) -> MeshResult<LinkState> {
        if !self.state.can_transition_to(next) {
            return Err(MeshError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    /// Sends an envelope. Fails with `LinkClosed` once the link is terminal.
    pub fn send(&self, envelope: &Envelope) -> MeshResult<()> {
        if self.state.is_terminal() {
            return Err(MeshError::LinkClosed);
        }
        self.sink.send(envelope)
    }

    /// Closes the transport connection and moves to `terminal`
    /// (`Closed` or `Error`). Returns `false` if already terminal.
    pub fn shut(&mut self, terminal: LinkState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.sink.close();
        self.state = terminal;
        true
    }

    pub fn record_snapshot(&mut self, vars: Vec<VarPair>) {
        self.snapshot = vars;
    }

    /// Adds pairs received from the remote to the handshake snapshot.
    pub fn extend_snapshot(&mut self, vars: impl IntoIterator<Item = VarPair>) {
        self.snapshot.extend(vars);
    }

    pub fn record_event(&mut self, event: EventMessage) {
        self.last_event = Some(event);
    }
}
