//! Per-node logical timestamps.
//!
//! Events are identified by `(sender, timestamp)`, so a node must never hand
//! out the same timestamp twice. The clock follows wall time in milliseconds
//! but never repeats or goes backwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, as stamped by the sending node.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp from milliseconds.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp in milliseconds.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Returns the current wall time.
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self(millis)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strictly increasing millisecond clock.
#[derive(Debug, Clone, Default)]
pub struct LogicalClock {
    last: Option<Timestamp>,
}

impl LogicalClock {
    /// Creates a clock that has not issued any timestamp yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next timestamp: wall time, or one past the previous
    /// timestamp if wall time has not advanced.
    pub fn tick(&mut self) -> Timestamp {
        let now = Timestamp::now();
        let next = match self.last {
            Some(last) if now <= last => Timestamp(last.0.saturating_add(1)),
            _ => now,
        };
        self.last = Some(next);
        next
    }

    /// Returns the last issued timestamp.
    #[must_use]
    pub fn last(&self) -> Option<Timestamp> {
        self.last
    }
}
