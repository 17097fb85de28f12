//! In-process transport.
//!
//! A [`MemoryNetwork`] plays the rendezvous role: it maps bound identifiers
//! to their accept queues. Each node gets its own [`MemoryTransport`] view
//! of the same network. Envelopes are passed as values over unbounded
//! channels, which gives the reliable ordered delivery the mesh expects.

use super::{Binding, Connection, ConnectionEvent, LinkSink, MeshTransport};
use crate::error::{MeshError, MeshResult};
use crate::protocol::Envelope;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

type AcceptQueue = mpsc::UnboundedSender<Connection>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared registry of bound identifiers.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<String, AcceptQueue>>>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport attached to this network.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            bound: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the identifiers currently bound on the network.
    pub fn bound_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.listeners)
            .iter()
            .filter(|(_, queue)| !queue.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    bound: Mutex<HashSet<String>>,
}

#[async_trait]
impl MeshTransport for MemoryTransport {
    async fn bind(&self, transport_id: &str) -> MeshResult<Binding> {
        let mut listeners = lock(&self.network.listeners);
        if let Some(existing) = listeners.get(transport_id) {
            if !existing.is_closed() {
                return Err(MeshError::TransportBindFailed(format!(
                    "{transport_id} is already taken"
                )));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(transport_id.to_string(), tx);
        lock(&self.bound).insert(transport_id.to_string());
        debug!("memory transport bound {transport_id}");

        Ok(Binding {
            local: transport_id.to_string(),
            incoming: rx,
        })
    }

    async fn dial(&self, local: &str, remote: &str) -> MeshResult<Connection> {
        let queue = lock(&self.network.listeners)
            .get(remote)
            .filter(|queue| !queue.is_closed())
            .cloned()
            .ok_or_else(|| MeshError::Network(format!("no peer bound at {remote}")))?;

        let (dialer_tx, dialer_rx) = mpsc::unbounded_channel();
        let (acceptor_tx, acceptor_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let accepted = Connection {
            remote: local.to_string(),
            sink: Box::new(MemorySink {
                peer: dialer_tx.clone(),
                closed: closed.clone(),
            }),
            events: acceptor_rx,
        };
        let _ = acceptor_tx.send(ConnectionEvent::Opened);

        queue
            .send(accepted)
            .map_err(|_| MeshError::Network(format!("{remote} stopped accepting")))?;

        let _ = dialer_tx.send(ConnectionEvent::Opened);
        Ok(Connection {
            remote: remote.to_string(),
            sink: Box::new(MemorySink {
                peer: acceptor_tx,
                closed,
            }),
            events: dialer_rx,
        })
    }

    fn unbind(&self, transport_id: &str) {
        if lock(&self.bound).remove(transport_id) {
            lock(&self.network.listeners).remove(transport_id);
            debug!("memory transport unbound {transport_id}");
        }
    }

    fn is_bound(&self, transport_id: &str) -> bool {
        if !lock(&self.bound).contains(transport_id) {
            return false;
        }
        lock(&self.network.listeners)
            .get(transport_id)
            .is_some_and(|queue| !queue.is_closed())
    }
}

/// Sending half of an in-process connection. Both halves share the
/// `closed` flag, so closing either end stops both.
struct MemorySink {
    peer: mpsc::UnboundedSender<ConnectionEvent>,
    closed: Arc<AtomicBool>,
}

impl LinkSink for MemorySink {
    fn send(&self, envelope: &Envelope) -> MeshResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::LinkClosed);
        }
        self.peer
            .send(ConnectionEvent::Data(envelope.clone()))
            .map_err(|_| MeshError::LinkClosed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.peer.send(ConnectionEvent::Closed);
        }
    }
}
