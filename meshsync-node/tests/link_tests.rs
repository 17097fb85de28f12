//! Tests for link.rs: state machine and send/close behavior.

use meshsync_node::protocol::{Envelope, VarUpdateMessage};
use meshsync_node::{Link, LinkId, LinkRole, LinkSink, LinkState, MeshError, MeshResult};
use meshsync_types::{Identity, Timestamp};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Recorded {
    sent: Vec<Envelope>,
    closes: usize,
}

struct RecordingSink(Arc<Mutex<Recorded>>);

impl LinkSink for RecordingSink {
    fn send(&self, envelope: &Envelope) -> MeshResult<()> {
        self.0.lock().unwrap().sent.push(envelope.clone());
        Ok(())
    }

    fn close(&self) {
        self.0.lock().unwrap().closes += 1;
    }
}

fn id(s: &str) -> Identity {
    Identity::new(s).unwrap()
}

fn make_link(role: LinkRole) -> (Link, Arc<Mutex<Recorded>>) {
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let link = Link::new(
        LinkId::new(1),
        id("bob"),
        role,
        Box::new(RecordingSink(recorded.clone())),
    );
    (link, recorded)
}

fn update() -> Envelope {
    Envelope::VarUpdate(VarUpdateMessage {
        sender: id("alice"),
        time: Timestamp::from_millis(1),
        key: "k".into(),
        value: "v".into(),
    })
}

// ── State machine ────────────────────────────────────────────────

#[test]
fn starts_opening() {
    let (link, _) = make_link(LinkRole::Initiator);
    assert_eq!(link.state(), LinkState::Opening);
    assert!(!link.is_open());
}

#[test]
fn happy_path_transitions() {
    let (mut link, _) = make_link(LinkRole::Initiator);
    assert_eq!(
        link.transition(LinkState::Handshaking).unwrap(),
        LinkState::Opening
    );
    assert_eq!(link.transition(LinkState::Open).unwrap(), LinkState::Handshaking);
    assert!(link.is_open());
    assert_eq!(link.transition(LinkState::Closed).unwrap(), LinkState::Open);
}

#[test]
fn cannot_skip_handshake() {
    let (mut link, _) = make_link(LinkRole::Initiator);
    let err = link.transition(LinkState::Open).unwrap_err();
    assert_eq!(
        err,
        MeshError::InvalidTransition {
            from: LinkState::Opening,
            to: LinkState::Open,
        }
    );
    assert_eq!(link.state(), LinkState::Opening);
}

#[test]
fn terminal_states_are_final() {
    for terminal in [LinkState::Closed, LinkState::Error] {
        assert!(terminal.is_terminal());
        for next in [
            LinkState::Opening,
            LinkState::Handshaking,
            LinkState::Open,
            LinkState::Closed,
            LinkState::Error,
        ] {
            assert!(!terminal.can_transition_to(next));
        }
    }
}

#[test]
fn every_live_state_can_fail() {
    for state in [LinkState::Opening, LinkState::Handshaking, LinkState::Open] {
        assert!(state.can_transition_to(LinkState::Error));
        assert!(state.can_transition_to(LinkState::Closed));
    }
}

// ── Send and close ───────────────────────────────────────────────

#[test]
fn send_goes_to_sink() {
    let (link, recorded) = make_link(LinkRole::Initiator);
    link.send(&update()).unwrap();
    assert_eq!(recorded.lock().unwrap().sent, vec![update()]);
}

#[test]
fn send_after_shut_fails() {
    let (mut link, recorded) = make_link(LinkRole::Initiator);
    assert!(link.shut(LinkState::Closed));
    assert_eq!(link.send(&update()), Err(MeshError::LinkClosed));
    assert!(recorded.lock().unwrap().sent.is_empty());
}

#[test]
fn shut_is_idempotent() {
    let (mut link, recorded) = make_link(LinkRole::Responder);
    assert!(link.shut(LinkState::Error));
    assert!(!link.shut(LinkState::Closed));
    assert_eq!(link.state(), LinkState::Error);
    assert_eq!(recorded.lock().unwrap().closes, 1);
}

// ── Accessors ────────────────────────────────────────────────────

#[test]
fn initiator_follows_role() {
    let alice = id("alice");
    let (outbound, _) = make_link(LinkRole::Initiator);
    let (inbound, _) = make_link(LinkRole::Responder);
    assert_eq!(outbound.initiator(&alice), &alice);
    assert_eq!(inbound.initiator(&alice), &id("bob"));
}

#[test]
fn info_reflects_current_state() {
    let (mut link, _) = make_link(LinkRole::Responder);
    link.transition(LinkState::Handshaking).unwrap();
    let info = link.info();
    assert_eq!(info.id, LinkId::new(1));
    assert_eq!(info.remote, id("bob"));
    assert_eq!(info.role, LinkRole::Responder);
    assert_eq!(info.state, LinkState::Handshaking);
}

#[test]
fn records_snapshot_and_event() {
    let (mut link, _) = make_link(LinkRole::Initiator);
    link.record_snapshot(vec![("a".into(), "1".into())]);
    assert_eq!(link.snapshot(), &[("a".to_string(), "1".to_string())]);
    assert!(link.last_event().is_none());
}

#[test]
fn snapshot_covers_both_directions() {
    let (mut link, _) = make_link(LinkRole::Responder);
    link.record_snapshot(vec![("sent".into(), "1".into())]);
    link.extend_snapshot(vec![("received".into(), "2".into())]);

    assert!(link.covers(&("sent".into(), "1".into())));
    assert!(link.covers(&("received".into(), "2".into())));
    assert!(!link.covers(&("sent".into(), "changed".into())));
    assert_eq!(link.snapshot().len(), 2);
}

#[test]
fn link_id_display() {
    assert_eq!(LinkId::new(7).to_string(), "#7");
    assert_eq!(LinkId::new(7).get(), 7);
}

#[test]
fn state_and_role_display_match_wire_names() {
    assert_eq!(LinkState::Handshaking.to_string(), "handshaking");
    assert_eq!(LinkRole::Responder.to_string(), "responder");
    assert_eq!(
        serde_json::to_value(LinkState::Handshaking).unwrap(),
        "handshaking"
    );
}
