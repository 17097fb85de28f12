//! Listener registries for mesh notifications.
//!
//! Listeners are plain callbacks invoked synchronously, in registration
//! order, from the node's event loop. A listener must not block.

use crate::link::{LinkInfo, LinkRole, LinkState};
use meshsync_types::Identity;
use serde::Serialize;

/// Handle returned by a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SubscriptionId(u64);

/// Mesh lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MeshNotification {
    /// The node bound its identity.
    Opened { identity: Identity },
    /// The node released its identity.
    Closed { identity: Identity },
    /// A link was requested: an outbound connect started or an inbound
    /// connection arrived.
    LinkRequested { remote: Identity, role: LinkRole },
    /// A link changed state.
    LinkStateChanged { state: LinkState, link: LinkInfo },
    /// A link completed its handshake.
    LinkConnected { link: LinkInfo },
    /// A link was closed by either side.
    LinkClosed { link: LinkInfo },
    /// A link failed.
    LinkError { link: LinkInfo, reason: String },
    /// A shared variable changed value. `origin` is the writer, or `None`
    /// for a write made on this node while closed.
    VarChanged {
        key: String,
        value: String,
        origin: Option<Identity>,
    },
}

/// Boxed listener callback.
pub type Listener<T> = Box<dyn Fn(&T) + Send>;

/// Ordered list of listeners for one notification kind.
pub struct ListenerRegistry<T> {
    listeners: Vec<(SubscriptionId, Listener<T>)>,
}

impl<T> ListenerRegistry<T> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Adds a listener under the given id.
    pub fn subscribe(&mut self, id: SubscriptionId, listener: Listener<T>) {
        self.listeners.push((id, listener));
    }

    /// Removes a listener. Returns whether it was registered here.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    /// Invokes every listener in registration order.
    pub fn notify(&self, value: &T) {
        for (_, listener) in &self.listeners {
            listener(value);
        }
    }
}

impl<T> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands out subscription ids shared across registries.
#[derive(Debug, Default)]
pub struct SubscriptionIds {
    next: u64,
}

impl SubscriptionIds {
    pub fn next_id(&mut self) -> SubscriptionId {
        self.next += 1;
        SubscriptionId(self.next)
    }
}
