#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **concord-store-fallback** – Durable flat string-keyed fallback storage.
//!
//! Used when the primary backend is unavailable or quota-failed. Backed by a
//! dedicated `sled::Tree` so that fallback writes survive a process restart,
//! but it never performs multi-key transactions and speaks only flat
//! string-to-bytes puts/gets, mirroring `localStorage`'s contract. Object
//! store keys are namespaced `rhythm_fallback_<store>_<id>`; a handful of
//! fixed raw keys (the migration flag, the compensation log, the emergency
//! backup) live alongside them in the same tree.
//!
//! [`StorageBackend::report`] always reports [`BackendKind::Fallback`].

use std::path::Path;

use async_trait::async_trait;
use concord_store_core::{BackendKind, BackendReport, StorageBackend, StoreError};
use concord_types::TabId;
use serde_json::Value;
use sled::Tree;

/// Prefix every namespaced object-store key carries.
pub const NAMESPACE_PREFIX: &str = "rhythm_fallback_";

fn namespaced_key(store: &str, id: &str) -> String {
    format!("{NAMESPACE_PREFIX}{store}_{id}")
}

fn namespace_scan_prefix(store: &str) -> String {
    format!("{NAMESPACE_PREFIX}{store}_")
}

/// Durable flat KV fallback backend.
#[derive(Debug, Clone)]
pub struct FallbackStore {
    tree: Tree,
}

impl FallbackStore {
    /// Open (or create) the fallback tree inside an existing sled database.
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        let tree = db
            .open_tree("fallback")
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { tree })
    }

    /// Open a standalone sled database at `path` and use its default tree as
    /// the fallback, for deployments that keep the fallback store
    /// independent of the primary's database file.
    pub fn open_standalone<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::open(&db)
    }

    /// Create a temporary, disk-backed fallback store for tests.
    #[cfg(any(test, feature = "test-util"))]
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::open(&db)
    }

    /// Raw, unnamespaced get — for the migration flag, the compensation log
    /// list, and the emergency-backup key.
    pub fn get_raw(&self, key: &str) -> Result<Option<Value>, StoreError> {
        match self.tree.get(key).map_err(|e| StoreError::Backend(e.to_string()))? {
            Some(bytes) => {
                let value: Value = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Raw, unnamespaced put.
    pub fn put_raw(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.tree
            .insert(key, bytes)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Raw, unnamespaced delete. No-op if absent.
    pub fn delete_raw(&self, key: &str) -> Result<(), StoreError> {
        self.tree
            .remove(key)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Fixed key under which `concord-session` parks its emergency backup.
    pub fn emergency_backup_key(tab: &TabId) -> String {
        format!("emergency_backup_{tab}")
    }
}

#[async_trait]
impl StorageBackend for FallbackStore {
    async fn put(&self, store: &str, value: Value) -> Result<(), StoreError> {
        let id = concord_store_core::extract_id(&value)?;
        self.put_raw(&namespaced_key(store, &id), &value)
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.get_raw(&namespaced_key(store, key))
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Value>, StoreError> {
        let prefix = namespace_scan_prefix(store);
        let mut out = Vec::new();
        for entry in self.tree.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = entry.map_err(|e| StoreError::Backend(e.to_string()))?;
            let value: Value =
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Backend(e.to_string()))?;
            out.push(value);
        }
        Ok(out)
    }

    async fn delete(&self, store: &str, key: &str) -> Result<(), StoreError> {
        self.delete_raw(&namespaced_key(store, key))
    }

    async fn clear(&self, store: &str) -> Result<(), StoreError> {
        let prefix = namespace_scan_prefix(store);
        let keys: Vec<_> = self
            .tree
            .scan_prefix(prefix.as_bytes())
            .keys()
            .filter_map(Result::ok)
            .collect();
        for key in keys {
            self.tree
                .remove(key)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    async fn count(&self, store: &str) -> Result<usize, StoreError> {
        let prefix = namespace_scan_prefix(store);
        Ok(self.tree.scan_prefix(prefix.as_bytes()).count())
    }

    fn report(&self) -> BackendReport {
        BackendReport {
            kind: BackendKind::Fallback,
            item_count: Some(self.tree.len()),
            fallback_mode: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = FallbackStore::temporary().unwrap();
        store.put("sessions", json!({"id": "s1", "title": "hi"})).await.unwrap();
        let got = store.get("sessions", "s1").await.unwrap();
        assert_eq!(got.unwrap()["title"], "hi");
    }

    #[tokio::test]
    async fn get_all_only_returns_items_for_the_named_store() {
        let store = FallbackStore::temporary().unwrap();
        store.put("sessions", json!({"id": "s1"})).await.unwrap();
        store.put("chunks", json!({"id": "c1"})).await.unwrap();

        let sessions = store.get_all("sessions").await.unwrap();
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_a_single_item() {
        let store = FallbackStore::temporary().unwrap();
        store.put("sessions", json!({"id": "s1"})).await.unwrap();
        store.delete("sessions", "s1").await.unwrap();
        assert!(store.get("sessions", "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_removes_every_item_in_the_store_only() {
        let store = FallbackStore::temporary().unwrap();
        store.put("sessions", json!({"id": "s1"})).await.unwrap();
        store.put("sessions", json!({"id": "s2"})).await.unwrap();
        store.put("chunks", json!({"id": "c1"})).await.unwrap();

        store.clear("sessions").await.unwrap();

        assert_eq!(store.count("sessions").await.unwrap(), 0);
        assert_eq!(store.count("chunks").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn raw_keys_are_not_namespaced_like_object_store_items() {
        let store = FallbackStore::temporary().unwrap();
        store.put_raw("migration_complete", &json!(true)).unwrap();
        assert_eq!(store.get_raw("migration_complete").unwrap(), Some(json!(true)));
    }

    #[test]
    fn report_identifies_as_fallback() {
        let store = FallbackStore::temporary().unwrap();
        assert_eq!(store.report().kind, BackendKind::Fallback);
        assert!(store.report().fallback_mode);
    }
}
