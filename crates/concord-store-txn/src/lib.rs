#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **concord-store-txn** – Compensation-log transactions over the storage
//! backend abstraction.
//!
//! A transaction body receives a [`TransactionCtx`] whose `put`/`delete`
//! record an inverse operation in the compensation log *before* applying the
//! forward operation. On body success the transaction is already fully
//! applied — commit is a no-op. On body failure, recorded inverses replay in
//! reverse order. If an inverse itself fails, the compensation log is kept
//! and the system enters [`FatalState`] — new transactions are rejected
//! until [`StoreTransactions::clear_fatal_state`] is called.

use std::collections::VecDeque;
use std::sync::Arc;

use concord_bus::EventBus;
use concord_store_core::{BackendKind, StorageBackend, StoreError};
use concord_store_fallback::FallbackStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

const COMPENSATION_STORE: &str = "_compensation_log";
const COMPENSATION_FALLBACK_KEY: &str = "compensation_log";
const MEMORY_LOG_CAP: usize = 100;

/// Errors a transaction run may surface.
#[derive(Debug, thiserror::Error)]
pub enum TxnError {
    /// The chosen backend reported an error while applying an operation.
    #[error("backend error: {0}")]
    Backend(String),
    /// The body failed and at least one inverse also failed to apply.
    /// Some operations were rolled back, some were not.
    #[error("partial commit: rollback did not fully complete")]
    PartialCommit,
    /// The fatal-state latch is set; new transactions are rejected.
    #[error("fatal state latched: {0}")]
    FatalLatched(String),
}

impl From<StoreError> for TxnError {
    fn from(value: StoreError) -> Self {
        TxnError::Backend(value.to_string())
    }
}

/// The inverse of a single forward operation, to be replayed on rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InverseOp {
    /// Restore a value that existed before the forward write.
    Put(Value),
    /// Delete a key that did not exist before the forward write.
    Delete(String),
}

/// One entry in the compensation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationEntry {
    /// Unique id of this log entry.
    pub id: Uuid,
    /// Transaction this entry belongs to.
    pub transaction_id: Uuid,
    /// Which backend the forward operation (and its inverse) target.
    pub backend: BackendKind,
    /// Object store the forward operation targeted.
    pub store: String,
    /// The inverse operation, applied on rollback.
    pub inverse: InverseOp,
    /// Whether this entry's rollback has already run (or was not needed
    /// because the transaction committed).
    pub resolved: bool,
    /// Wall-clock time the entry was recorded.
    pub timestamp: i64,
}

/// `{reason, timestamp, transactionId, compensationLogCount}` latch set when
/// a rollback cannot fully complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FatalState {
    /// Why the latch was set.
    pub reason: String,
    /// When it was set.
    pub timestamp: i64,
    /// The transaction whose rollback failed.
    pub transaction_id: Uuid,
    /// Number of compensation-log entries outstanding at latch time.
    pub compensation_log_count: usize,
}

struct MemoryLog {
    entries: VecDeque<CompensationEntry>,
}

impl MemoryLog {
    fn push(&mut self, entry: CompensationEntry) {
        if self.entries.len() >= MEMORY_LOG_CAP {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
}

/// Transaction coordinator wrapping a primary backend and fallback KV,
/// implementing the compensation-log, three-tier persistence, and
/// fatal-state semantics.
pub struct StoreTransactions {
    primary: Arc<dyn StorageBackend>,
    fallback: Arc<FallbackStore>,
    memory_log: Mutex<MemoryLog>,
    fatal: Mutex<Option<FatalState>>,
    bus: Option<Arc<EventBus>>,
}

impl StoreTransactions {
    /// Build a coordinator over `primary` and `fallback`, optionally wired
    /// to an [`EventBus`] for `transaction:fatal_cleared`.
    pub fn new(
        primary: Arc<dyn StorageBackend>,
        fallback: Arc<FallbackStore>,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            primary,
            fallback,
            memory_log: Mutex::new(MemoryLog {
                entries: VecDeque::new(),
            }),
            fatal: Mutex::new(None),
            bus,
        }
    }

    /// Whether the fatal-state latch is currently set.
    pub fn is_fatal(&self) -> bool {
        self.fatal.lock().is_some()
    }

    /// Direct (non-transactional) access to one of the two backends, for
    /// reads that don't need compensation-log protection.
    pub fn backend_handle(&self, kind: BackendKind) -> Arc<dyn StorageBackend> {
        self.backend(kind)
    }

    /// The current fatal state, if latched.
    pub fn fatal_state(&self) -> Option<FatalState> {
        self.fatal.lock().clone()
    }

    /// Clear the fatal-state latch and emit `transaction:fatal_cleared`.
    pub fn clear_fatal_state(&self, reason: &str) {
        let was = self.fatal.lock().take();
        if was.is_some() {
            info!(reason, "fatal state cleared");
            if let Some(bus) = &self.bus {
                let _ = bus.publish(
                    "transaction:fatal_cleared",
                    serde_json::json!({ "reason": reason }),
                );
            }
        }
    }

    fn backend(&self, kind: BackendKind) -> Arc<dyn StorageBackend> {
        match kind {
            BackendKind::Primary => self.primary.clone(),
            BackendKind::Fallback => self.fallback.clone() as Arc<dyn StorageBackend>,
        }
    }

    /// Run `body` inside a transaction. The body is invoked at most once.
    /// On success, the already-applied forward operations stand; on
    /// failure, the recorded inverses are replayed in reverse order.
    pub async fn run<'s, T, E, F, Fut>(&'s self, body: F) -> Result<T, TxnError>
    where
        F: FnOnce(TransactionCtx<'s>) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>> + 's,
        E: std::fmt::Display,
    {
        if let Some(fatal) = self.fatal_state() {
            return Err(TxnError::FatalLatched(fatal.reason));
        }

        let transaction_id = Uuid::new_v4();
        let ops = Arc::new(Mutex::new(Vec::new()));
        let ctx = TransactionCtx {
            txn: self,
            transaction_id,
            ops: ops.clone(),
        };

        let result = body(ctx).await;
        let mut ops = Arc::try_unwrap(ops)
            .unwrap_or_else(|shared| Mutex::new(shared.lock().clone()))
            .into_inner();
        match result {
            Ok(value) => {
                for entry in ops.iter_mut() {
                    entry.resolved = true;
                }
                Ok(value)
            }
            Err(err) => {
                warn!(%transaction_id, error = %err, "transaction body failed, rolling back");
                Err(self.rollback(transaction_id, ops, err.to_string()).await)
            }
        }
    }

    async fn rollback(
        &self,
        transaction_id: Uuid,
        entries: Vec<CompensationEntry>,
        body_error: String,
    ) -> TxnError {
        let mut all_ok = true;
        for entry in entries.iter().rev() {
            let backend = self.backend(entry.backend);
            let result = match &entry.inverse {
                InverseOp::Put(value) => backend.put(&entry.store, value.clone()).await,
                InverseOp::Delete(key) => backend.delete(&entry.store, key).await,
            };
            if let Err(err) = result {
                error!(%transaction_id, error = %err, "inverse operation failed during rollback");
                all_ok = false;
            } else {
                self.resolve(entry.id);
            }
        }

        if all_ok {
            TxnError::Backend(body_error)
        } else {
            let count = self.compensation_log_count();
            let state = FatalState {
                reason: "rollback inverse failed".to_string(),
                timestamp: chrono::Utc::now().timestamp(),
                transaction_id,
                compensation_log_count: count,
            };
            error!(%transaction_id, "entering fatal state: rollback could not fully complete");
            *self.fatal.lock() = Some(state);
            TxnError::PartialCommit
        }
    }

    /// Persist one compensation-log entry via the three-tier fallback:
    /// primary store, then fallback KV, then the bounded in-memory list.
    async fn persist_entry_async(&self, entry: &CompensationEntry) {
        let value = serde_json::to_value(entry).expect("CompensationEntry always serializes");
        if self.primary.put(COMPENSATION_STORE, value.clone()).await.is_ok() {
            return;
        }
        if self
            .fallback
            .put_raw(&format!("{COMPENSATION_FALLBACK_KEY}_{}", entry.id), &value)
            .is_ok()
        {
            return;
        }
        self.memory_log.lock().push(entry.clone());
    }

    fn resolve(&self, id: Uuid) {
        self.memory_log
            .lock()
            .entries
            .iter_mut()
            .filter(|e| e.id == id)
            .for_each(|e| e.resolved = true);
    }

    /// Union of the compensation log across all three tiers (primary store,
    /// fallback KV, and the bounded in-memory list).
    pub async fn compensation_log(&self) -> Vec<CompensationEntry> {
        let mut out = Vec::new();
        if let Ok(values) = self.primary.get_all(COMPENSATION_STORE).await {
            for value in values {
                if let Ok(entry) = serde_json::from_value::<CompensationEntry>(value) {
                    out.push(entry);
                }
            }
        }
        out.extend(self.memory_log.lock().entries.iter().cloned());
        out
    }

    fn compensation_log_count(&self) -> usize {
        self.memory_log.lock().entries.len()
    }

    /// Remove resolved entries from the bounded in-memory tier. Primary/
    /// fallback cleanup is left to their own housekeeping since neither is
    /// bounded in the same way.
    pub fn cleanup_resolved(&self) {
        self.memory_log.lock().entries.retain(|e| !e.resolved);
    }
}

/// Opaque transaction object passed to a [`StoreTransactions::run`] body.
pub struct TransactionCtx<'a> {
    txn: &'a StoreTransactions,
    transaction_id: Uuid,
    ops: Arc<Mutex<Vec<CompensationEntry>>>,
}

impl<'a> TransactionCtx<'a> {
    /// This transaction's id.
    pub fn id(&self) -> Uuid {
        self.transaction_id
    }

    /// Write `value` into `store` on `backend`. Records the inverse (the
    /// prior value, or a delete if there was none) before applying.
    pub async fn put(&self, backend: BackendKind, store: &str, value: Value) -> Result<(), TxnError> {
        let target = self.txn.backend(backend);
        let id = concord_store_core::extract_id(&value)?;
        let existing = target.get(store, &id).await?;
        let inverse = match existing {
            Some(prior) => InverseOp::Put(prior),
            None => InverseOp::Delete(id.clone()),
        };
        let entry = CompensationEntry {
            id: Uuid::new_v4(),
            transaction_id: self.transaction_id,
            backend,
            store: store.to_string(),
            inverse,
            resolved: false,
            timestamp: chrono::Utc::now().timestamp(),
        };
        self.txn.persist_entry_async(&entry).await;
        self.ops.lock().push(entry);
        target.put(store, value).await?;
        Ok(())
    }

    /// Delete `key` from `store` on `backend`. Records the inverse (restore
    /// the prior value) before applying; a no-op delete of an absent key
    /// records no inverse.
    pub async fn delete(&self, backend: BackendKind, store: &str, key: &str) -> Result<(), TxnError> {
        let target = self.txn.backend(backend);
        let existing = target.get(store, key).await?;
        if let Some(prior) = existing {
            let entry = CompensationEntry {
                id: Uuid::new_v4(),
                transaction_id: self.transaction_id,
                backend,
                store: store.to_string(),
                inverse: InverseOp::Put(prior),
                resolved: false,
                timestamp: chrono::Utc::now().timestamp(),
            };
            self.txn.persist_entry_async(&entry).await;
            self.ops.lock().push(entry);
        }
        target.delete(store, key).await?;
        Ok(())
    }

    /// Read `key` from `store` on `backend` without recording any inverse.
    pub async fn get(&self, backend: BackendKind, store: &str, key: &str) -> Result<Option<Value>, TxnError> {
        Ok(self.txn.backend(backend).get(store, key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_store_primary::PrimaryStore;
    use serde_json::json;

    fn harness() -> StoreTransactions {
        let primary: Arc<dyn StorageBackend> = Arc::new(PrimaryStore::temporary().unwrap());
        let fallback = Arc::new(FallbackStore::temporary().unwrap());
        StoreTransactions::new(primary, fallback, None)
    }

    #[tokio::test]
    async fn successful_body_leaves_forward_writes_in_place() {
        let txn = harness();
        let result: Result<(), String> = txn
            .run(|ctx| async move {
                ctx.put(BackendKind::Primary, "sessions", json!({"id": "s1", "v": 1}))
                    .await
                    .map_err(|e| e.to_string())
            })
            .await
            .map(|_| ());
        assert!(result.is_ok());
        let stored = txn.primary.get("sessions", "s1").await.unwrap();
        assert_eq!(stored.unwrap()["v"], 1);
    }

    #[tokio::test]
    async fn failed_body_rolls_back_a_fresh_write() {
        let txn = harness();
        let result: Result<(), TxnError> = txn
            .run(|ctx| async move {
                ctx.put(BackendKind::Primary, "sessions", json!({"id": "s1", "v": 1}))
                    .await?;
                Err::<(), TxnError>(TxnError::Backend("deliberate failure".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(txn.primary.get("sessions", "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_body_restores_the_prior_value() {
        let txn = harness();
        txn.primary.put("sessions", json!({"id": "s1", "v": 1})).await.unwrap();

        let _: Result<(), TxnError> = txn
            .run(|ctx| async move {
                ctx.put(BackendKind::Primary, "sessions", json!({"id": "s1", "v": 2}))
                    .await?;
                Err::<(), TxnError>(TxnError::Backend("deliberate failure".to_string()))
            })
            .await;

        let stored = txn.primary.get("sessions", "s1").await.unwrap();
        assert_eq!(stored.unwrap()["v"], 1);
    }

    #[tokio::test]
    async fn fatal_latch_rejects_new_transactions_until_cleared() {
        let txn = harness();
        *txn.fatal.lock() = Some(FatalState {
            reason: "test".to_string(),
            timestamp: 0,
            transaction_id: Uuid::new_v4(),
            compensation_log_count: 0,
        });

        let result: Result<(), TxnError> = txn.run(|_ctx| async move { Ok(()) }).await;
        assert!(matches!(result, Err(TxnError::FatalLatched(_))));

        txn.clear_fatal_state("resolved");
        let result: Result<(), TxnError> = txn.run(|_ctx| async move { Ok(()) }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn compensation_log_contains_entries_after_a_write() {
        let txn = harness();
        let _: Result<(), TxnError> = txn
            .run(|ctx| async move {
                ctx.put(BackendKind::Primary, "sessions", json!({"id": "s1"})).await
            })
            .await;
        let log = txn.compensation_log().await;
        assert_eq!(log.len(), 1);
    }
}
