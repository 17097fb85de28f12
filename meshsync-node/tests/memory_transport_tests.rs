//! Tests for the in-process transport.

use meshsync_node::protocol::{Envelope, VarUpdateMessage};
use meshsync_node::{ConnectionEvent, MemoryNetwork, MeshError, MeshTransport};
use meshsync_types::{Identity, Timestamp};

fn update(value: &str) -> Envelope {
    Envelope::VarUpdate(VarUpdateMessage {
        sender: Identity::new("a").unwrap(),
        time: Timestamp::from_millis(1),
        key: "k".into(),
        value: value.into(),
    })
}

// ── Bind ─────────────────────────────────────────────────────────

#[tokio::test]
async fn bind_and_unbind() {
    let network = MemoryNetwork::new();
    let transport = network.transport();

    let binding = transport.bind("a").await.unwrap();
    assert_eq!(binding.local, "a");
    assert!(transport.is_bound("a"));
    assert_eq!(network.bound_ids(), vec!["a".to_string()]);

    transport.unbind("a");
    assert!(!transport.is_bound("a"));
    assert!(network.bound_ids().is_empty());
}

#[tokio::test]
async fn bind_taken_id_fails() {
    let network = MemoryNetwork::new();
    let first = network.transport();
    let second = network.transport();

    let _binding = first.bind("a").await.unwrap();
    let err = second.bind("a").await.unwrap_err();
    assert!(matches!(err, MeshError::TransportBindFailed(_)));
    assert!(!second.is_bound("a"));
}

#[tokio::test]
async fn id_reusable_after_binding_dropped() {
    let network = MemoryNetwork::new();
    let first = network.transport();
    let second = network.transport();

    drop(first.bind("a").await.unwrap());
    assert!(second.bind("a").await.is_ok());
}

#[tokio::test]
async fn unbind_of_foreign_id_is_ignored() {
    let network = MemoryNetwork::new();
    let owner = network.transport();
    let other = network.transport();

    let _binding = owner.bind("a").await.unwrap();
    other.unbind("a");
    assert!(owner.is_bound("a"));
}

// ── Dial ─────────────────────────────────────────────────────────

#[tokio::test]
async fn dial_unknown_peer_fails() {
    let network = MemoryNetwork::new();
    let transport = network.transport();
    let err = transport.dial("a", "nobody").await.unwrap_err();
    assert!(matches!(err, MeshError::Network(_)));
}

#[tokio::test]
async fn dial_delivers_both_directions() {
    let network = MemoryNetwork::new();
    let a = network.transport();
    let b = network.transport();
    let mut binding = b.bind("b").await.unwrap();

    let mut outbound = a.dial("a", "b").await.unwrap();
    let mut inbound = binding.incoming.recv().await.unwrap();
    assert_eq!(outbound.remote, "b");
    assert_eq!(inbound.remote, "a");

    assert_eq!(outbound.events.recv().await, Some(ConnectionEvent::Opened));
    assert_eq!(inbound.events.recv().await, Some(ConnectionEvent::Opened));

    outbound.sink.send(&update("1")).unwrap();
    inbound.sink.send(&update("2")).unwrap();
    assert_eq!(
        inbound.events.recv().await,
        Some(ConnectionEvent::Data(update("1")))
    );
    assert_eq!(
        outbound.events.recv().await,
        Some(ConnectionEvent::Data(update("2")))
    );
}

#[tokio::test]
async fn delivery_preserves_order() {
    let network = MemoryNetwork::new();
    let a = network.transport();
    let b = network.transport();
    let mut binding = b.bind("b").await.unwrap();
    let outbound = a.dial("a", "b").await.unwrap();
    let mut inbound = binding.incoming.recv().await.unwrap();
    let _ = inbound.events.recv().await;

    for i in 0..20 {
        outbound.sink.send(&update(&i.to_string())).unwrap();
    }
    for i in 0..20 {
        assert_eq!(
            inbound.events.recv().await,
            Some(ConnectionEvent::Data(update(&i.to_string())))
        );
    }
}

#[tokio::test]
async fn close_notifies_peer_and_stops_both_ends() {
    let network = MemoryNetwork::new();
    let a = network.transport();
    let b = network.transport();
    let mut binding = b.bind("b").await.unwrap();
    let outbound = a.dial("a", "b").await.unwrap();
    let mut inbound = binding.incoming.recv().await.unwrap();
    let _ = inbound.events.recv().await;

    outbound.sink.close();
    outbound.sink.close();
    assert_eq!(inbound.events.recv().await, Some(ConnectionEvent::Closed));
    assert_eq!(outbound.sink.send(&update("x")), Err(MeshError::LinkClosed));
    assert_eq!(inbound.sink.send(&update("x")), Err(MeshError::LinkClosed));
}
