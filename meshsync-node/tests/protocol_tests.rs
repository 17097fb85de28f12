//! Tests for protocol.rs: envelope wire shape and helpers.

use meshsync_node::protocol::{
    Envelope, EventMessage, SnapshotMessage, VarUpdateMessage, PROTOCOL_VERSION,
};
use meshsync_types::{Identity, Timestamp};
use pretty_assertions::assert_eq;
use serde_json::json;

fn id(s: &str) -> Identity {
    Identity::new(s).unwrap()
}

fn event() -> EventMessage {
    EventMessage {
        sender: id("alice"),
        time: Timestamp::from_millis(42),
        event_type: "chat".into(),
        payload: "hello".into(),
    }
}

// ── Wire shape ───────────────────────────────────────────────────

#[test]
fn sync_request_wire_shape() {
    let envelope = Envelope::SyncRequest(SnapshotMessage {
        sender: id("bob"),
        time: Timestamp::from_millis(7),
        vars: vec![("color".into(), "blue".into())],
    });
    assert_eq!(
        serde_json::to_value(&envelope).unwrap(),
        json!({
            "type": "sync-request",
            "sender": "bob",
            "time": 7,
            "vars": [["color", "blue"]],
        })
    );
}

#[test]
fn event_wire_shape_uses_camel_case() {
    assert_eq!(
        serde_json::to_value(Envelope::Event(event())).unwrap(),
        json!({
            "type": "event",
            "sender": "alice",
            "time": 42,
            "eventType": "chat",
            "payload": "hello",
        })
    );
}

#[test]
fn var_update_decodes() {
    let decoded: Envelope = serde_json::from_value(json!({
        "type": "var-update",
        "sender": "carol",
        "time": 3,
        "key": "k",
        "value": "",
    }))
    .unwrap();
    assert_eq!(
        decoded,
        Envelope::VarUpdate(VarUpdateMessage {
            sender: id("carol"),
            time: Timestamp::from_millis(3),
            key: "k".into(),
            value: String::new(),
        })
    );
}

#[test]
fn empty_sender_is_rejected() {
    let result: Result<Envelope, _> = serde_json::from_value(json!({
        "type": "event",
        "sender": "",
        "time": 1,
        "eventType": "x",
        "payload": "",
    }));
    assert!(result.is_err());
}

#[test]
fn unknown_type_is_rejected() {
    let result: Result<Envelope, _> = serde_json::from_value(json!({
        "type": "gossip",
        "sender": "a",
        "time": 1,
    }));
    assert!(result.is_err());
}

// ── Helpers ──────────────────────────────────────────────────────

#[test]
fn kind_and_handshake_flags() {
    let snapshot = SnapshotMessage {
        sender: id("bob"),
        time: Timestamp::from_millis(1),
        vars: Vec::new(),
    };
    let request = Envelope::SyncRequest(snapshot.clone());
    let answer = Envelope::SyncAnswer(snapshot);
    let ev = Envelope::Event(event());

    assert_eq!(request.kind(), "sync-request");
    assert_eq!(answer.kind(), "sync-answer");
    assert_eq!(ev.kind(), "event");
    assert!(request.is_handshake());
    assert!(answer.is_handshake());
    assert!(!ev.is_handshake());
}

#[test]
fn event_key_ignores_type_and_payload() {
    let a = event();
    let mut b = event();
    b.event_type = "other".into();
    b.payload = "different".into();
    assert_eq!(a.key(), b.key());
}

#[test]
fn protocol_version_is_one() {
    assert_eq!(PROTOCOL_VERSION, 1);
}
