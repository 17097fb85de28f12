//! Mesh protocol envelopes.
//!
//! Four envelope kinds travel over a link:
//! 1. `sync-request`: the responder's full variable snapshot at handshake
//! 2. `sync-answer`: the initiator's merged snapshot, completing the handshake
//! 3. `var-update`: one key's new value, merged and relayed
//! 4. `event`: a broadcast event, de-duplicated and relayed
//!
//! Envelopes are decoded once at the transport boundary; everything above it
//! works with this enum.

use meshsync_types::{Identity, Timestamp};
use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

/// A `(key, value)` pair of the shared variable store.
pub type VarPair = (String, String);

/// A mesh protocol envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// Responder's snapshot, sent when the link opens.
    SyncRequest(SnapshotMessage),

    /// Initiator's snapshot after merging the request.
    SyncAnswer(SnapshotMessage),

    /// A single variable update.
    VarUpdate(VarUpdateMessage),

    /// A broadcast event.
    Event(EventMessage),
}

impl Envelope {
    /// The wire tag of the envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncRequest(_) => "sync-request",
            Self::SyncAnswer(_) => "sync-answer",
            Self::VarUpdate(_) => "var-update",
            Self::Event(_) => "event",
        }
    }

    /// Whether this envelope belongs to the handshake.
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::SyncRequest(_) | Self::SyncAnswer(_))
    }
}

/// Full variable snapshot exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMessage {
    pub sender: Identity,
    pub time: Timestamp,
    /// Pairs in key order.
    pub vars: Vec<VarPair>,
}

/// One variable's new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarUpdateMessage {
    pub sender: Identity,
    pub time: Timestamp,
    pub key: String,
    pub value: String,
}

/// A broadcast event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub sender: Identity,
    pub time: Timestamp,
    pub event_type: String,
    pub payload: String,
}

impl EventMessage {
    /// The pair that identifies this event across the mesh.
    pub fn key(&self) -> EventKey {
        EventKey {
            sender: self.sender.clone(),
            time: self.time,
        }
    }
}

/// Identity of an event: two envelopes are the same event iff their keys
/// are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub sender: Identity,
    pub time: Timestamp,
}
