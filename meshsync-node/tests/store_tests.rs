//! Tests for store.rs: the variable map and the seen-event history.

use meshsync_node::protocol::EventKey;
use meshsync_node::{SeenEvents, VarStore, DEFAULT_DEDUP_CAPACITY};
use meshsync_types::{Identity, Timestamp};

fn key(sender: &str, time: u64) -> EventKey {
    EventKey {
        sender: Identity::new(sender).unwrap(),
        time: Timestamp::from_millis(time),
    }
}

// ── VarStore ─────────────────────────────────────────────────────

#[test]
fn set_reports_change() {
    let mut store = VarStore::new();
    assert!(store.set("color", "blue"));
    assert!(!store.set("color", "blue"));
    assert!(store.set("color", "red"));
    assert_eq!(store.get("color"), Some("red"));
}

#[test]
fn get_missing_is_none() {
    let store = VarStore::new();
    assert_eq!(store.get("nope"), None);
    assert!(store.is_empty());
}

#[test]
fn empty_value_is_a_value() {
    let mut store = VarStore::new();
    assert!(store.set("k", ""));
    assert_eq!(store.get("k"), Some(""));
    assert_eq!(store.len(), 1);
}

#[test]
fn merge_returns_only_changed_pairs() {
    let mut store = VarStore::new();
    store.set("a", "1");
    store.set("b", "2");

    let changed = store.merge(vec![
        ("a".to_string(), "1".to_string()),
        ("b".to_string(), "3".to_string()),
        ("c".to_string(), "4".to_string()),
    ]);

    assert_eq!(
        changed,
        vec![
            ("b".to_string(), "3".to_string()),
            ("c".to_string(), "4".to_string()),
        ]
    );
    assert_eq!(store.get("b"), Some("3"));
}

#[test]
fn merge_later_pair_wins_within_batch() {
    let mut store = VarStore::new();
    store.merge(vec![
        ("k".to_string(), "first".to_string()),
        ("k".to_string(), "second".to_string()),
    ]);
    assert_eq!(store.get("k"), Some("second"));
}

#[test]
fn snapshot_is_key_ordered() {
    let mut store = VarStore::new();
    store.set("zeta", "z");
    store.set("alpha", "a");
    store.set("mid", "m");

    let keys: Vec<String> = store.snapshot().into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["alpha", "mid", "zeta"]);
}

// ── SeenEvents ───────────────────────────────────────────────────

#[test]
fn default_capacity_is_ten() {
    assert_eq!(SeenEvents::default().capacity(), DEFAULT_DEDUP_CAPACITY);
    assert_eq!(DEFAULT_DEDUP_CAPACITY, 10);
}

#[test]
fn record_rejects_duplicate() {
    let mut seen = SeenEvents::new(4);
    assert!(seen.record(key("a", 1)));
    assert!(!seen.record(key("a", 1)));
    assert_eq!(seen.len(), 1);
}

#[test]
fn same_time_different_sender_is_distinct() {
    let mut seen = SeenEvents::new(4);
    assert!(seen.record(key("a", 1)));
    assert!(seen.record(key("b", 1)));
}

#[test]
fn evicts_oldest_when_full() {
    let mut seen = SeenEvents::new(2);
    seen.record(key("a", 1));
    seen.record(key("a", 2));
    seen.record(key("a", 3));

    assert_eq!(seen.len(), 2);
    assert!(!seen.record(key("a", 3)));

    // Evicted events count as new again.
    assert!(seen.record(key("a", 1)));
    assert!(!seen.record(key("a", 3)));
}

#[test]
fn zero_capacity_is_clamped() {
    let mut seen = SeenEvents::new(0);
    assert_eq!(seen.capacity(), 1);
    assert!(seen.record(key("a", 1)));
    assert!(!seen.record(key("a", 1)));
}
