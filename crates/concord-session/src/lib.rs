#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **concord-session** – Canonical session-lifecycle consumer.
//!
//! Manages a single "current record" (an ordered message list) plus an
//! indexed collection of records, all mutations routed through
//! `concord-store-txn` so appends are atomic: either the write persists or
//! the in-memory view is restored. A debounced save path and an
//! emergency-backup/recovery pair round out the page-hide/process-restart
//! story described for the browser original.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use concord_store_core::{BackendKind, StoreError};
use concord_store_fallback::FallbackStore;
use concord_store_txn::{StoreTransactions, TxnError};
use concord_types::TabId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

const SESSIONS_STORE: &str = "sessions";
const DEFAULT_EMERGENCY_BACKUP_MAX_AGE: Duration = Duration::from_secs(3600);
const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Errors surfaced by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No record is currently active.
    #[error("no active session record")]
    NoActiveRecord,
    /// The requested record id does not exist.
    #[error("unknown session record '{0}'")]
    UnknownRecord(String),
    /// The underlying transaction failed.
    #[error("transaction error: {0}")]
    Transaction(#[from] TxnError),
    /// The underlying storage backend failed.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// A session record: an ordered message list plus metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Record id.
    pub id: String,
    /// When the record was first created.
    pub created_at: DateTime<Utc>,
    /// Ordered messages appended to this record.
    pub messages: Vec<Value>,
    /// Monotonic write epoch for conflict detection.
    #[serde(rename = "_writeEpoch")]
    pub write_epoch: u64,
}

impl SessionRecord {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            messages: Vec::new(),
            write_epoch: 0,
        }
    }
}

/// The fixed shape written to the fallback KV on an emergency backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmergencyBackup {
    id: String,
    created_at: DateTime<Utc>,
    messages: Vec<Value>,
    timestamp: DateTime<Utc>,
}

/// Canonical session-lifecycle consumer.
pub struct SessionManager {
    txn: Arc<StoreTransactions>,
    fallback: Arc<FallbackStore>,
    tab_id: TabId,
    current: Mutex<Option<SessionRecord>>,
    save_generation: Arc<AtomicU64>,
    emergency_backup_max_age: Duration,
    save_debounce: Duration,
}

impl SessionManager {
    /// Build a manager for `tab_id` over `txn`/`fallback`.
    pub fn new(txn: Arc<StoreTransactions>, fallback: Arc<FallbackStore>, tab_id: TabId) -> Self {
        Self {
            txn,
            fallback,
            tab_id,
            current: Mutex::new(None),
            save_generation: Arc::new(AtomicU64::new(0)),
            emergency_backup_max_age: DEFAULT_EMERGENCY_BACKUP_MAX_AGE,
            save_debounce: DEFAULT_SAVE_DEBOUNCE,
        }
    }

    /// Override the emergency-backup freshness window (default one hour).
    pub fn with_emergency_backup_max_age(mut self, age: Duration) -> Self {
        self.emergency_backup_max_age = age;
        self
    }

    /// Override the default debounce delay used by bare `save()` calls.
    pub fn with_save_debounce(mut self, delay: Duration) -> Self {
        self.save_debounce = delay;
        self
    }

    /// The currently active record, cloned. A fresh record is created on
    /// first access if none is active.
    pub async fn current(&self) -> SessionRecord {
        {
            let guard = self.current.lock();
            if let Some(record) = guard.as_ref() {
                return record.clone();
            }
        }
        self.create().await
    }

    /// Create a fresh record, persist it, and make it the active one.
    pub async fn create(&self) -> SessionRecord {
        let record = SessionRecord::new();
        *self.current.lock() = Some(record.clone());
        let _ = self.persist_atomic(&record).await;
        record
    }

    /// Load a record by id without making it active.
    pub async fn load(&self, id: &str) -> Result<SessionRecord, SessionError> {
        let value = self
            .txn
            .backend_handle(BackendKind::Primary)
            .get(SESSIONS_STORE, id)
            .await?;
        let value = value.ok_or_else(|| SessionError::UnknownRecord(id.to_string()))?;
        Ok(serde_json::from_value(value).map_err(|e| SessionError::Storage(StoreError::Backend(e.to_string())))?)
    }

    /// Load `id` and make it the active record.
    pub async fn activate(&self, id: &str) -> Result<SessionRecord, SessionError> {
        let record = self.load(id).await?;
        *self.current.lock() = Some(record.clone());
        Ok(record)
    }

    /// Flush any pending save for the current record, then activate `id`.
    pub async fn switch(&self, id: &str) -> Result<SessionRecord, SessionError> {
        self.flush_pending_save().await?;
        self.activate(id).await
    }

    /// Append a single message to the active record, atomically.
    pub async fn append(&self, message: Value) -> Result<SessionRecord, SessionError> {
        self.append_batch(vec![message]).await
    }

    /// Append several messages to the active record in one atomic write.
    pub async fn append_batch(&self, messages: Vec<Value>) -> Result<SessionRecord, SessionError> {
        let mut record = self.current().await;
        let before = record.clone();
        record.messages.extend(messages);
        record.write_epoch += 1;

        match self.persist_atomic(&record).await {
            Ok(()) => {
                *self.current.lock() = Some(record.clone());
                Ok(record)
            }
            Err(err) => {
                warn!(error = %err, "append failed, restoring in-memory record");
                *self.current.lock() = Some(before.clone());
                Err(err.into())
            }
        }
    }

    /// Truncate the active record's message list to `len`. Debounced, not
    /// immediately persisted — call [`Self::flush_pending_save`] to force
    /// durability.
    pub fn truncate(&self, len: usize) {
        let mut guard = self.current.lock();
        if let Some(record) = guard.as_mut() {
            record.messages.truncate(len);
        }
        drop(guard);
        self.schedule_save(self.save_debounce);
    }

    /// Remove the message at `index` from the active record. Debounced.
    pub fn remove_at(&self, index: usize) {
        let mut guard = self.current.lock();
        if let Some(record) = guard.as_mut() {
            if index < record.messages.len() {
                record.messages.remove(index);
            }
        }
        drop(guard);
        self.schedule_save(self.save_debounce);
    }

    async fn persist_atomic(&self, record: &SessionRecord) -> Result<(), TxnError> {
        let value = serde_json::to_value(record).expect("SessionRecord always serializes");
        self.txn
            .run(|ctx| {
                let value = value.clone();
                async move { ctx.put(BackendKind::Primary, SESSIONS_STORE, value).await }
            })
            .await
    }

    /// Arm a debounced save; a subsequent call before `delay` elapses
    /// cancels and reschedules rather than stacking up timers.
    pub fn schedule_save(&self, delay: Duration) {
        let generation = self.save_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let txn = self.txn.clone();
        let current = self.snapshot();
        let generations = self.save_generation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if generations.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Some(record) = current {
                let value = serde_json::to_value(&record).expect("SessionRecord always serializes");
                if let Err(err) = txn
                    .run(|ctx| {
                        let value = value.clone();
                        async move { ctx.put(BackendKind::Primary, SESSIONS_STORE, value).await }
                    })
                    .await
                {
                    warn!(error = %err, "debounced save failed; in-memory record unaffected");
                } else {
                    info!("debounced save completed");
                }
            }
        });
    }

    fn snapshot(&self) -> Option<SessionRecord> {
        self.current.lock().clone()
    }

    /// Persist the active record immediately, superseding any pending
    /// debounced save.
    pub async fn flush_pending_save(&self) -> Result<(), SessionError> {
        self.save_generation.fetch_add(1, Ordering::SeqCst);
        let Some(record) = self.snapshot() else {
            return Ok(());
        };
        self.persist_atomic(&record).await?;
        Ok(())
    }

    /// Serialize the active record into the fallback KV under this tab's
    /// emergency-backup key.
    pub fn emergency_backup_sync(&self) -> Result<(), SessionError> {
        let Some(record) = self.snapshot() else {
            return Ok(());
        };
        let backup = EmergencyBackup {
            id: record.id,
            created_at: record.created_at,
            messages: record.messages,
            timestamp: Utc::now(),
        };
        let key = FallbackStore::emergency_backup_key(&self.tab_id);
        let value = serde_json::to_value(&backup).expect("EmergencyBackup always serializes");
        self.fallback.put_raw(&key, &value)?;
        Ok(())
    }

    /// On startup: if a fresh emergency backup exists, merge its messages
    /// into the persistent record and delete the backup; if it is stale,
    /// delete it without merging.
    pub async fn recover_emergency_backup(&self) -> Result<Option<SessionRecord>, SessionError> {
        let key = FallbackStore::emergency_backup_key(&self.tab_id);
        let Some(raw) = self.fallback.get_raw(&key)? else {
            return Ok(None);
        };
        let backup: EmergencyBackup = serde_json::from_value(raw)
            .map_err(|e| SessionError::Storage(StoreError::Backend(e.to_string())))?;

        let age = Utc::now().signed_duration_since(backup.timestamp);
        let is_fresh = age.to_std().map(|d| d <= self.emergency_backup_max_age).unwrap_or(false);

        self.fallback.delete_raw(&key)?;

        if !is_fresh {
            info!(tab = %self.tab_id, "emergency backup stale, discarding");
            return Ok(None);
        }

        info!(tab = %self.tab_id, "merging fresh emergency backup");
        let mut record = match self.load(&backup.id).await {
            Ok(record) => record,
            Err(SessionError::UnknownRecord(_)) => SessionRecord {
                id: backup.id,
                created_at: backup.created_at,
                messages: Vec::new(),
                write_epoch: 0,
            },
            Err(err) => return Err(err),
        };
        record.messages.extend(backup.messages);
        record.write_epoch += 1;
        self.persist_atomic(&record).await?;
        *self.current.lock() = Some(record.clone());
        Ok(Some(record))
    }

    /// Remove every record and the active one, and clear any emergency
    /// backup for this tab.
    pub async fn clear_all(&self) -> Result<(), SessionError> {
        self.txn.backend_handle(BackendKind::Primary).clear(SESSIONS_STORE).await?;
        let _ = self.fallback.delete_raw(&FallbackStore::emergency_backup_key(&self.tab_id));
        *self.current.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_store_primary::PrimaryStore;
    use serde_json::json;

    fn harness() -> SessionManager {
        let primary: Arc<dyn concord_store_core::StorageBackend> =
            Arc::new(PrimaryStore::temporary().unwrap());
        let fallback = Arc::new(FallbackStore::temporary().unwrap());
        let txn = Arc::new(StoreTransactions::new(primary, fallback.clone(), None));
        SessionManager::new(txn, fallback, TabId::from("tab-1"))
    }

    #[tokio::test]
    async fn first_access_creates_a_record() {
        let sessions = harness();
        let record = sessions.current().await;
        assert!(record.messages.is_empty());
    }

    #[tokio::test]
    async fn append_persists_atomically() {
        let sessions = harness();
        let record = sessions.current().await;
        sessions.append(json!({"text": "hi"})).await.unwrap();

        let reloaded = sessions.load(&record.id).await.unwrap();
        assert_eq!(reloaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn switch_loads_a_different_record() {
        let sessions = harness();
        let first = sessions.current().await;
        sessions.append(json!({"text": "a"})).await.unwrap();

        let second = sessions.create().await;
        sessions.append(json!({"text": "b"})).await.unwrap();

        let back = sessions.switch(&first.id).await.unwrap();
        assert_eq!(back.id, first.id);
        assert_eq!(back.messages.len(), 1);
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn emergency_backup_round_trips_through_recovery() {
        let sessions = harness();
        let record = sessions.current().await;
        sessions.append(json!({"text": "hello"})).await.unwrap();
        sessions.emergency_backup_sync().unwrap();

        // Simulate a fresh process: clear in-memory state, recover.
        *sessions.current.lock() = None;
        let recovered = sessions.recover_emergency_backup().await.unwrap();
        assert!(recovered.is_some());
        assert_eq!(recovered.unwrap().id, record.id);

        // Backup key is gone after recovery.
        let key = FallbackStore::emergency_backup_key(&sessions.tab_id);
        assert!(sessions.fallback.get_raw(&key).unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_backup_is_discarded_without_merging() {
        let sessions = harness().with_emergency_backup_max_age(Duration::from_secs(0));
        sessions.current().await;
        sessions.emergency_backup_sync().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let recovered = sessions.recover_emergency_backup().await.unwrap();
        assert!(recovered.is_none());
    }

    #[tokio::test]
    async fn clear_all_removes_every_record() {
        let sessions = harness();
        let record = sessions.current().await;
        sessions.clear_all().await.unwrap();
        assert!(matches!(sessions.load(&record.id).await, Err(SessionError::UnknownRecord(_))));
    }
}
