#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **concord-types** – Shared primitive data structures for the Concord
//! coordination and storage substrate.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that every other `concord-*` crate can depend on it without
//! causing cycles. It intentionally makes no assumptions about I/O,
//! cryptography, or storage engines.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod config;

pub use config::ConcordConfig;

//─────────────────────────────
//  Identifiers
//─────────────────────────────

/// Stable identifier for a tab, valid for the lifetime of its process/task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub String);

impl TabId {
    /// Generate a fresh random tab id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TabId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Monotonic write epoch used for last-writer-wins conflict resolution on
/// object-store items.
pub type WriteEpoch = u64;

//─────────────────────────────
//  Priority
//─────────────────────────────

/// Priority tier shared by the operation queue and the cleanup registry.
/// Ordered so that `Priority::Critical > Priority::Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Lowest priority; processed/cleaned up first under pressure.
    Low,
    /// Default priority for most operations.
    Normal,
    /// Above-default priority.
    High,
    /// Highest priority; never reordered behind lower-priority work.
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Cleanup priority used by the degradation controller's item registry.
/// `NeverDelete` sorts below every real priority and is always excluded from
/// `_getItemsForCleanup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CleanupPriority {
    /// Must never be removed by automated cleanup (e.g. the active session).
    NeverDelete,
    /// Removed only under aggressive/emergency cleanup.
    Low,
    /// Removed under critical-and-above cleanup.
    Medium,
    /// Removed under warning-and-above cleanup.
    High,
    /// Removed first, at any tier above normal.
    Aggressive,
}

//─────────────────────────────
//  Quota tiers
//─────────────────────────────

/// One of the five named quota states driving degradation behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QuotaTier {
    /// Usage is comfortably below the warning boundary.
    Normal,
    /// Usage has crossed the warning boundary; eviction policy tightens.
    Warning,
    /// Usage has crossed the critical boundary; storage goes read-only.
    Critical,
    /// Usage has crossed the exceeded boundary; emergency cleanup runs.
    Exceeded,
    /// Usage is over quota, or the backend connection has failed outright.
    Emergency,
}

//─────────────────────────────
//  Queued-operation status
//─────────────────────────────

/// Lifecycle status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Waiting to be processed.
    Pending,
    /// Currently holding the lock and running its body.
    Processing,
    /// Finished successfully.
    Completed,
    /// Exhausted its retry budget or hit a non-retryable error.
    Failed,
    /// Cancelled before it ran, or while waiting.
    Cancelled,
}

//─────────────────────────────
//  Re-exported duration helper
//─────────────────────────────

/// Convenience alias used across crates when a config field is expressed in
/// milliseconds but stored/transmitted as a `Duration`.
pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
