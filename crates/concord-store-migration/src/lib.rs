#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **concord-store-migration** – One-shot migration of legacy flat-KV keys
//! from the fallback store into their corresponding primary object stores.
//!
//! Runs at most once per process lifetime (tracked by a flag key in the
//! fallback store). A key's failure to parse or write does not block
//! migration of the others; per-key outcomes are reported back to the
//! caller.

use std::sync::Arc;

use concord_store_core::StorageBackend;
use concord_store_fallback::FallbackStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const MIGRATION_FLAG_KEY: &str = "migration_complete";

/// A single legacy fallback key and the primary store it migrates into.
#[derive(Debug, Clone)]
pub struct LegacyKey {
    /// The flat key under which the legacy value lives in the fallback KV.
    pub fallback_key: &'static str,
    /// The primary object store the parsed value should be written to.
    pub target_store: &'static str,
}

/// Outcome of migrating a single legacy key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyOutcome {
    /// The key was absent; nothing to migrate.
    Absent,
    /// Migrated and the legacy key was deleted.
    Migrated,
    /// The value failed to parse as JSON, or had no usable `id`.
    ParseFailed,
    /// The primary write failed; the legacy key was left in place.
    WriteFailed,
}

/// Per-key migration result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Results keyed by the legacy fallback key.
    pub results: Vec<(String, KeyOutcome)>,
}

impl MigrationReport {
    /// Whether every key either migrated cleanly or was already absent.
    pub fn fully_succeeded(&self) -> bool {
        self.results
            .iter()
            .all(|(_, outcome)| matches!(outcome, KeyOutcome::Absent | KeyOutcome::Migrated))
    }
}

/// Drives the one-shot legacy-key migration.
pub struct MigrationRunner {
    primary: Arc<dyn StorageBackend>,
    fallback: Arc<FallbackStore>,
    legacy_keys: Vec<LegacyKey>,
}

impl MigrationRunner {
    /// Build a runner over `primary`/`fallback` for the fixed list of legacy
    /// keys known to this deployment.
    pub fn new(
        primary: Arc<dyn StorageBackend>,
        fallback: Arc<FallbackStore>,
        legacy_keys: Vec<LegacyKey>,
    ) -> Self {
        Self {
            primary,
            fallback,
            legacy_keys,
        }
    }

    /// Whether a migration is still needed: false once the flag is set, or
    /// if none of the configured legacy keys are present.
    pub fn needs_migration(&self) -> bool {
        if self.is_complete() {
            return false;
        }
        self.legacy_keys
            .iter()
            .any(|key| matches!(self.fallback.get_raw(key.fallback_key), Ok(Some(_))))
    }

    fn is_complete(&self) -> bool {
        matches!(self.fallback.get_raw(MIGRATION_FLAG_KEY), Ok(Some(_)))
    }

    /// Run the migration once. If the flag is already set, returns an empty
    /// report immediately without touching any keys.
    pub async fn run_once(&self) -> MigrationReport {
        if self.is_complete() {
            return MigrationReport { results: Vec::new() };
        }

        let mut results = Vec::new();
        for key in &self.legacy_keys {
            let outcome = self.migrate_one(key).await;
            if outcome != KeyOutcome::WriteFailed {
                info!(key = key.fallback_key, ?outcome, "legacy key migration result");
            } else {
                warn!(key = key.fallback_key, ?outcome, "legacy key migration result");
            }
            results.push((key.fallback_key.to_string(), outcome));
        }

        let _ = self.fallback.put_raw(MIGRATION_FLAG_KEY, &serde_json::json!(true));
        MigrationReport { results }
    }

    async fn migrate_one(&self, key: &LegacyKey) -> KeyOutcome {
        let raw = match self.fallback.get_raw(key.fallback_key) {
            Ok(Some(value)) => value,
            Ok(None) => return KeyOutcome::Absent,
            Err(_) => return KeyOutcome::ParseFailed,
        };

        if concord_store_core::extract_id(&raw).is_err() {
            return KeyOutcome::ParseFailed;
        }

        match self.primary.put(key.target_store, raw).await {
            Ok(()) => {
                let _ = self.fallback.delete_raw(key.fallback_key);
                KeyOutcome::Migrated
            }
            Err(_) => KeyOutcome::WriteFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_store_primary::PrimaryStore;
    use serde_json::json;

    fn legacy_keys() -> Vec<LegacyKey> {
        vec![LegacyKey {
            fallback_key: "legacy_sessions",
            target_store: "sessions",
        }]
    }

    #[tokio::test]
    async fn migrates_a_present_legacy_key_and_deletes_it() {
        let primary: Arc<dyn StorageBackend> = Arc::new(PrimaryStore::temporary().unwrap());
        let fallback = Arc::new(FallbackStore::temporary().unwrap());
        fallback.put_raw("legacy_sessions", &json!({"id": "s1"})).unwrap();

        let runner = MigrationRunner::new(primary.clone(), fallback.clone(), legacy_keys());
        assert!(runner.needs_migration());

        let report = runner.run_once().await;
        assert!(report.fully_succeeded());
        assert!(primary.get("sessions", "s1").await.unwrap().is_some());
        assert!(fallback.get_raw("legacy_sessions").unwrap().is_none());
    }

    #[tokio::test]
    async fn needs_migration_is_false_when_no_legacy_keys_present() {
        let primary: Arc<dyn StorageBackend> = Arc::new(PrimaryStore::temporary().unwrap());
        let fallback = Arc::new(FallbackStore::temporary().unwrap());
        let runner = MigrationRunner::new(primary, fallback, legacy_keys());
        assert!(!runner.needs_migration());
    }

    #[tokio::test]
    async fn second_run_is_a_no_op_even_if_keys_reappear() {
        let primary: Arc<dyn StorageBackend> = Arc::new(PrimaryStore::temporary().unwrap());
        let fallback = Arc::new(FallbackStore::temporary().unwrap());
        fallback.put_raw("legacy_sessions", &json!({"id": "s1"})).unwrap();

        let runner = MigrationRunner::new(primary.clone(), fallback.clone(), legacy_keys());
        runner.run_once().await;

        fallback.put_raw("legacy_sessions", &json!({"id": "s2"})).unwrap();
        let report = runner.run_once().await;
        assert!(report.results.is_empty());
        assert!(primary.get("sessions", "s2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn a_failing_key_does_not_block_the_others() {
        let primary: Arc<dyn StorageBackend> = Arc::new(PrimaryStore::temporary().unwrap());
        let fallback = Arc::new(FallbackStore::temporary().unwrap());
        fallback.put_raw("legacy_sessions", &json!({"no_id": true})).unwrap();
        fallback.put_raw("legacy_chunks", &json!({"id": "c1"})).unwrap();

        let keys = vec![
            LegacyKey { fallback_key: "legacy_sessions", target_store: "sessions" },
            LegacyKey { fallback_key: "legacy_chunks", target_store: "chunks" },
        ];
        let runner = MigrationRunner::new(primary.clone(), fallback.clone(), keys);
        let report = runner.run_once().await;

        assert!(!report.fully_succeeded());
        assert!(primary.get("chunks", "c1").await.unwrap().is_some());
    }
}
