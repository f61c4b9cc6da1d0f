#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **concord-clock** – Lamport logical clock for cross-tab causal ordering.
//!
//! Every `concord-coordinator` message is stamped with the sender's logical
//! clock before it goes through `concord-message-security`'s signing step.
//! Receivers fold the remote timestamp back into their own clock so that
//! causality is preserved even though the underlying transport gives no
//! ordering guarantee of its own.

use std::cmp::Ordering;

use concord_types::TabId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A logical timestamp paired with the sender that produced it.
///
/// Ordering is primarily by `timestamp` ascending, tie-broken by `sender_id`
/// ascending, which gives a deterministic total order across all senders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    /// The Lamport timestamp at the moment of stamping.
    pub timestamp: u64,
    /// The stable id of the tab that produced this stamp.
    pub sender_id: TabId,
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.sender_id.cmp(&other.sender_id))
    }
}

impl Stamp {
    /// Whether `self` happened-before `other` under the Lamport + sender-id
    /// total order. Strict: a stamp never happens-before itself.
    pub fn happened_before(&self, other: &Self) -> bool {
        self < other
    }
}

/// A process-wide Lamport counter for one tab.
#[derive(Debug)]
pub struct LamportClock {
    sender_id: TabId,
    counter: Mutex<u64>,
}

impl LamportClock {
    /// Create a clock starting at zero for `sender_id`.
    pub fn new(sender_id: TabId) -> Self {
        Self {
            sender_id,
            counter: Mutex::new(0),
        }
    }

    /// The sender id this clock stamps with.
    pub fn sender_id(&self) -> &TabId {
        &self.sender_id
    }

    /// The current counter value without advancing it.
    pub fn current(&self) -> u64 {
        *self.counter.lock()
    }

    /// Advance the counter and return its new value. Mirrors the classic
    /// Lamport "local event" rule.
    pub fn tick(&self) -> u64 {
        let mut counter = self.counter.lock();
        *counter += 1;
        *counter
    }

    /// Fold a received timestamp into the local clock: `local = max(local,
    /// received) + 1`. Mirrors the classic Lamport "receive event" rule.
    pub fn update(&self, received: u64) -> u64 {
        let mut counter = self.counter.lock();
        *counter = (*counter).max(received) + 1;
        *counter
    }

    /// Produce a [`Stamp`] for an outbound message, advancing the clock.
    pub fn stamp(&self) -> Stamp {
        Stamp {
            timestamp: self.tick(),
            sender_id: self.sender_id.clone(),
        }
    }

    /// Reset the counter to zero. Intended for test determinism only.
    pub fn reset(&self) {
        *self.counter.lock() = 0;
    }
}
