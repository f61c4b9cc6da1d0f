#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **concord-store-core** – Shared storage abstractions for Concord.
//!
//! This crate defines the contracts `concord-store-primary` and
//! `concord-store-fallback` implement, without providing a concrete backend
//! of its own: the uniform named-object-store KV interface, write-epoch
//! conflict detection, and the conservative size estimator `concord-quota`
//! uses to decide whether a write fits the quota.

use async_trait::async_trait;
use concord_types::WriteEpoch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors a [`StorageBackend`] implementation may return.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The value has no usable `id` field.
    #[error("value has no string 'id' field")]
    MissingId,
    /// The named object store does not exist.
    #[error("unknown object store '{0}'")]
    UnknownStore(String),
    /// The underlying engine reported an error.
    #[error("backend error: {0}")]
    Backend(String),
    /// A transaction handle was used outside its active window.
    #[error("transaction is not active")]
    TransactionNotActive,
}

/// Extract the `id` field from a value as a storage key.
pub fn extract_id(value: &Value) -> Result<String, StoreError> {
    value
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(StoreError::MissingId)
}

/// Extract the optional `_writeEpoch` field from a value.
pub fn extract_write_epoch(value: &Value) -> Option<WriteEpoch> {
    value.get("_writeEpoch").and_then(Value::as_u64)
}

/// A conservative byte-size estimate for a value, used by `concord-quota` to
/// decide whether a prospective write fits the remaining budget.
pub fn estimate_data_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(0)
}

/// Outcome of comparing an existing stored value against an incoming write
/// using the write-epoch conflict rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictOutcome {
    /// Whether the two writes are at the same, already-claimed epoch.
    pub has_conflict: bool,
    /// Which side wins and should be the value actually stored.
    pub winner: ConflictWinner,
}

/// Which side of a detected (or absent) conflict should be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictWinner {
    /// The value already in the store should be kept.
    Existing,
    /// The incoming write should be persisted.
    Incoming,
}

/// Compare `existing` against `incoming` by write epoch. A record with no
/// epoch is legacy and can never conflict — the incoming write always wins.
pub fn detect_write_conflict(existing: Option<&Value>, incoming: &Value) -> ConflictOutcome {
    let existing_epoch = existing.and_then(extract_write_epoch);
    let incoming_epoch = extract_write_epoch(incoming);

    match (existing_epoch, incoming_epoch) {
        (Some(e), Some(i)) if e == i => ConflictOutcome {
            has_conflict: true,
            winner: ConflictWinner::Incoming,
        },
        (Some(e), Some(i)) if i > e => ConflictOutcome {
            has_conflict: false,
            winner: ConflictWinner::Incoming,
        },
        (Some(_), Some(_)) => ConflictOutcome {
            has_conflict: false,
            winner: ConflictWinner::Existing,
        },
        _ => ConflictOutcome {
            has_conflict: false,
            winner: ConflictWinner::Incoming,
        },
    }
}

/// Which of the two backends is currently serving reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// The durable, versioned, transactional primary.
    Primary,
    /// The flat string-keyed fallback.
    Fallback,
}

/// Connection health for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionState {
    /// Whether the backend is currently reachable.
    pub is_connected: bool,
    /// Whether the backend has been declared failed after exhausting its
    /// retry budget.
    pub is_failed: bool,
    /// Number of consecutive failed connection attempts.
    pub attempts: u32,
}

/// Self-reported status of a [`StorageBackend`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendReport {
    /// Which backend this report describes.
    pub kind: BackendKind,
    /// Number of items across all known stores, if cheaply known.
    pub item_count: Option<usize>,
    /// Whether the caller has activated fallback mode.
    pub fallback_mode: bool,
}

/// Uniform KV interface over a set of named object stores. Keys are always
/// drawn from the value's `id` field.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store `value` in `store`, keyed by `value["id"]`.
    async fn put(&self, store: &str, value: Value) -> Result<(), StoreError>;

    /// Fetch the value keyed by `key` in `store`.
    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Fetch every value currently in `store`.
    async fn get_all(&self, store: &str) -> Result<Vec<Value>, StoreError>;

    /// Remove the value keyed by `key` in `store`. No-op if absent.
    async fn delete(&self, store: &str, key: &str) -> Result<(), StoreError>;

    /// Remove every value in `store`.
    async fn clear(&self, store: &str) -> Result<(), StoreError>;

    /// Number of values currently in `store`.
    async fn count(&self, store: &str) -> Result<usize, StoreError>;

    /// Self-reported backend status.
    fn report(&self) -> BackendReport;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_id_reads_string_id_field() {
        assert_eq!(extract_id(&json!({"id": "x"})).unwrap(), "x");
    }

    #[test]
    fn extract_id_rejects_missing_id() {
        assert!(matches!(extract_id(&json!({})), Err(StoreError::MissingId)));
    }

    #[test]
    fn legacy_records_without_epoch_never_conflict() {
        let outcome = detect_write_conflict(Some(&json!({"id": "a"})), &json!({"id": "a"}));
        assert!(!outcome.has_conflict);
        assert_eq!(outcome.winner, ConflictWinner::Incoming);
    }

    #[test]
    fn same_epoch_is_a_conflict_resolved_to_incoming() {
        let existing = json!({"id": "a", "_writeEpoch": 5});
        let incoming = json!({"id": "a", "_writeEpoch": 5});
        let outcome = detect_write_conflict(Some(&existing), &incoming);
        assert!(outcome.has_conflict);
        assert_eq!(outcome.winner, ConflictWinner::Incoming);
    }

    #[test]
    fn higher_epoch_wins_without_conflict() {
        let existing = json!({"id": "a", "_writeEpoch": 5});
        let incoming = json!({"id": "a", "_writeEpoch": 6});
        let outcome = detect_write_conflict(Some(&existing), &incoming);
        assert!(!outcome.has_conflict);
        assert_eq!(outcome.winner, ConflictWinner::Incoming);
    }

    #[test]
    fn lower_epoch_loses_without_conflict() {
        let existing = json!({"id": "a", "_writeEpoch": 6});
        let incoming = json!({"id": "a", "_writeEpoch": 5});
        let outcome = detect_write_conflict(Some(&existing), &incoming);
        assert!(!outcome.has_conflict);
        assert_eq!(outcome.winner, ConflictWinner::Existing);
    }

    #[test]
    fn size_estimate_is_stable_for_equal_values() {
        let a = estimate_data_size(&json!({"id": "a", "v": 1}));
        let b = estimate_data_size(&json!({"v": 1, "id": "a"}));
        assert_eq!(a, b);
    }
}
