//! Replicated node state.
//!
//! The shared variable store and the bounded history of seen events used
//! for duplicate suppression.

use crate::protocol::{EventKey, VarPair};
use std::collections::{BTreeMap, HashSet, VecDeque};

/// Default depth of the seen-event history.
pub const DEFAULT_DEDUP_CAPACITY: usize = 10;

/// String key/value store shared across the mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarStore {
    vars: BTreeMap<String, String>,
}

impl VarStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a variable's value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Sets a variable. Returns whether the stored value changed.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        let value = value.into();
        if self.vars.get(&key) == Some(&value) {
            return false;
        }
        self.vars.insert(key, value);
        true
    }

    /// Overwrites every pair into the store, returning the pairs that
    /// actually changed a value.
    pub fn merge<I>(&mut self, pairs: I) -> Vec<VarPair>
    where
        I: IntoIterator<Item = VarPair>,
    {
        pairs
            .into_iter()
            .filter_map(|(key, value)| {
                if self.set(key.clone(), value.clone()) {
                    Some((key, value))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Returns all pairs in key order.
    pub fn snapshot(&self) -> Vec<VarPair> {
        self.vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Bounded FIFO of recently seen events.
///
/// Only the last `capacity` events are remembered; an event re-arriving
/// after being evicted is treated as new.
#[derive(Debug, Clone)]
pub struct SeenEvents {
    capacity: usize,
    order: VecDeque<EventKey>,
    index: HashSet<EventKey>,
}

impl SeenEvents {
    /// Creates a history holding at most `capacity` events (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            index: HashSet::with_capacity(capacity),
        }
    }

    /// Records an event, evicting the oldest entry when full. Returns
    /// `false` if the event was already present.
    pub fn record(&mut self, key: EventKey) -> bool {
        if self.index.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.index.remove(&oldest);
            }
        }
        self.index.insert(key.clone());
        self.order.push_back(key);
        true
    }

    /// Number of remembered events.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Maximum number of remembered events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for SeenEvents {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
