#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **concord-runtime** – Assembles the Concord components into one running
//! substrate.
//!
//! This crate owns no domain logic of its own. It wires `concord-bus`
//! through `concord-session` together in dependency order, runs the
//! process-restart recovery sequence (migration check, emergency-backup
//! recovery) before any tab claims leadership, and drives a bounded,
//! ordered graceful shutdown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use concord_bus::EventBus;
use concord_cancel::CancelRegistry;
use concord_coordinator::{BroadcastTransport, CoordinatorConfig, TabCoordinator, Transport};
use concord_degradation::{CleanupRegistry, DegradationController};
use concord_lock::LockManager;
use concord_message_security::SigningKey;
use concord_queue::OperationQueue;
use concord_quota::{QuotaManager, TierBoundaries};
use concord_session::SessionManager;
use concord_store_core::StorageBackend;
use concord_store_fallback::FallbackStore;
use concord_store_migration::{LegacyKey, MigrationRunner};
use concord_store_primary::PrimaryStore;
use concord_store_txn::StoreTransactions;
use concord_types::{ConcordConfig, TabId};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Legacy `localStorage`-style keys migrated into the primary backend on
/// first startup after an upgrade. Empty until a real migration is needed;
/// kept here so the migration machinery has a concrete, testable caller.
const LEGACY_KEYS: &[LegacyKey] = &[];

/// Errors surfaced by runtime assembly and lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Loading `ConcordConfig` failed.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Opening the backing store failed.
    #[error("storage error: {0}")]
    Storage(String),
}

/// A fully assembled Concord substrate for one tab.
pub struct ConcordRuntime {
    tab_id: TabId,
    config: ConcordConfig,
    bus: Arc<EventBus>,
    quota: Arc<QuotaManager>,
    degradation: Arc<DegradationController>,
    cleanup_registry: Arc<CleanupRegistry>,
    cancel: Arc<CancelRegistry>,
    locks: Arc<LockManager>,
    queue: Arc<OperationQueue>,
    txn: Arc<StoreTransactions>,
    session: Arc<SessionManager>,
    coordinator: Arc<TabCoordinator>,
    queue_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    coordinator_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConcordRuntime {
    /// Assemble every component over a `sled::Db` rooted at `data_dir`,
    /// run startup recovery, and start the background queue and
    /// coordinator loops. Tabs in the same process that want to talk to
    /// each other should share one `broadcast_domain` (see
    /// [`concord_coordinator::BroadcastTransport::new_domain`]); passing
    /// `None` creates a fresh, unconnected domain of one.
    pub async fn start(
        data_dir: impl AsRef<Path>,
        tab_id: TabId,
        broadcast_domain: Option<tokio::sync::broadcast::Sender<concord_message_security::SignedMessage>>,
    ) -> Result<Arc<Self>, RuntimeError> {
        let config = ConcordConfig::load().map_err(|e| RuntimeError::Configuration(e.to_string()))?;

        let db = sled::open(data_dir.as_ref()).map_err(|e| RuntimeError::Storage(e.to_string()))?;
        let primary: Arc<dyn StorageBackend> =
            Arc::new(PrimaryStore::from_db(db.clone()).map_err(|e| RuntimeError::Storage(e.to_string()))?);
        let fallback =
            Arc::new(FallbackStore::open(&db).map_err(|e| RuntimeError::Storage(e.to_string()))?);

        let bus = Arc::new(EventBus::new());
        let cleanup_registry = Arc::new(CleanupRegistry::new());
        let degradation = Arc::new(DegradationController::new(cleanup_registry.clone(), Some(bus.clone())));
        let quota = Arc::new(QuotaManager::new(
            TierBoundaries {
                warning: config.quota_warning_ratio,
                critical: config.quota_critical_ratio,
                exceeded: config.quota_exceeded_ratio,
            },
            Duration::from_secs(30),
            Some(bus.clone()),
        ));

        let txn = Arc::new(StoreTransactions::new(primary.clone(), fallback.clone(), Some(bus.clone())));

        let migration = MigrationRunner::new(primary.clone(), fallback.clone(), LEGACY_KEYS.to_vec());
        if migration.needs_migration() {
            let report = migration.run_once().await;
            info!(succeeded = report.fully_succeeded(), "startup migration check ran");
        }

        let locks = Arc::new(LockManager::new());
        let queue = OperationQueue::new(locks.clone(), Some(bus.clone()));

        let session = Arc::new(
            SessionManager::new(txn.clone(), fallback.clone(), tab_id.clone())
                .with_emergency_backup_max_age(config.emergency_backup_max_age())
                .with_save_debounce(config.save_debounce()),
        );
        if let Err(err) = session.recover_emergency_backup().await {
            warn!(error = %err, "emergency-backup recovery failed at startup");
        }

        let transport: Arc<dyn Transport> = match broadcast_domain {
            Some(tx) => Arc::new(BroadcastTransport::subscribe(&tx)),
            None => Arc::new(BroadcastTransport::new_domain(256).1),
        };
        let coordinator = TabCoordinator::new(
            tab_id.clone(),
            transport,
            SigningKey::generate(),
            Some(bus.clone()),
            CoordinatorConfig {
                heartbeat_interval: config.heartbeat_interval(),
                stale_threshold: config.stale_threshold(),
                claim_timeout: config.claim_timeout(),
                reconnect_attempts: config.reconnect_attempts,
                reconnect_backoff: config.reconnect_backoff(),
                message_max_age: config.message_max_age(),
                nonce_cache_capacity: config.nonce_cache_capacity,
            },
        );
        coordinator
            .connect()
            .await
            .map_err(|e| RuntimeError::Storage(e.to_string()))?;

        let runtime = Arc::new(Self {
            tab_id,
            config,
            bus,
            quota,
            degradation,
            cleanup_registry,
            cancel: Arc::new(CancelRegistry::new()),
            locks,
            queue: queue.clone(),
            txn,
            session,
            coordinator: coordinator.clone(),
            queue_task: tokio::sync::Mutex::new(None),
            coordinator_task: tokio::sync::Mutex::new(None),
        });

        *runtime.queue_task.lock().await = Some(tokio::spawn(queue.run()));
        *runtime.coordinator_task.lock().await = Some(tokio::spawn(coordinator.run()));

        Ok(runtime)
    }

    /// This runtime's tab id.
    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    /// The aggregate configuration this runtime was started with.
    pub fn config(&self) -> &ConcordConfig {
        &self.config
    }

    /// The shared event bus every component publishes onto.
    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// The operation queue.
    pub fn queue(&self) -> Arc<OperationQueue> {
        self.queue.clone()
    }

    /// The transaction coordinator.
    pub fn transactions(&self) -> Arc<StoreTransactions> {
        self.txn.clone()
    }

    /// The session manager.
    pub fn session(&self) -> Arc<SessionManager> {
        self.session.clone()
    }

    /// The tab coordinator.
    pub fn coordinator(&self) -> Arc<TabCoordinator> {
        self.coordinator.clone()
    }

    /// The cascading-abort cancel registry.
    pub fn cancel(&self) -> Arc<CancelRegistry> {
        self.cancel.clone()
    }

    /// Report current storage usage to the quota manager and, if that
    /// crosses a tier boundary, drive the degradation controller. Neither
    /// `concord-quota` nor `concord-degradation` talks to the other
    /// directly, so this is the glue between them.
    pub fn report_usage(&self, used_bytes: u64, quota_bytes: u64) {
        self.quota.report_usage(used_bytes, quota_bytes);
        let tier = self.quota.evaluate();
        self.degradation.on_tier_change(tier, used_bytes);
    }

    /// The cleanup registry items are staged against, for example a
    /// session or cached chunk that becomes eligible for eviction under
    /// storage pressure.
    pub fn cleanup_registry(&self) -> Arc<CleanupRegistry> {
        self.cleanup_registry.clone()
    }

    /// Drain the operation queue, flush the active session save, and close
    /// the coordinator transport, in that order. Each step is bounded by
    /// `per_step_timeout`; a step that doesn't finish in time is logged and
    /// skipped rather than hanging shutdown indefinitely.
    pub async fn shutdown(self: Arc<Self>, per_step_timeout: Duration) {
        info!(tab = %self.tab_id, "concord runtime shutdown starting");

        if tokio::time::timeout(per_step_timeout, self.drain_queue()).await.is_err() {
            warn!("queue drain did not finish before shutdown timeout");
        }

        let still_held = self.locks.held_locks();
        if !still_held.is_empty() {
            warn!(locks = ?still_held, "locks still held after queue drain");
        }

        match tokio::time::timeout(per_step_timeout, self.session.flush_pending_save()).await {
            Err(_) => warn!("session flush did not finish before shutdown timeout"),
            Ok(Err(err)) => warn!(error = %err, "session flush failed during shutdown"),
            Ok(Ok(())) => {}
        }

        if let Some(task) = self.coordinator_task.lock().await.take() {
            self.coordinator.release_primary().await;
            task.abort();
        }
        if let Some(task) = self.queue_task.lock().await.take() {
            task.abort();
        }

        info!(tab = %self.tab_id, "concord runtime shutdown complete");
    }

    async fn drain_queue(&self) {
        while !self.queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_then_shutdown_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ConcordRuntime::start(dir.path(), TabId::generate(), None).await.unwrap();

        runtime.report_usage(10, 1000);
        runtime.clone().shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn two_tabs_sharing_a_domain_elect_a_single_leader() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let (tx, _root) = BroadcastTransport::new_domain(64);
        let a = ConcordRuntime::start(dir_a.path(), TabId::from("a"), Some(tx.clone()))
            .await
            .unwrap();
        let b = ConcordRuntime::start(dir_b.path(), TabId::from("b"), Some(tx))
            .await
            .unwrap();

        let first = a.coordinator().claim_primary().await.unwrap();
        assert!(first.granted);
        let second = b.coordinator().claim_primary().await.unwrap();
        assert!(!second.granted);

        a.shutdown(Duration::from_secs(2)).await;
        b.shutdown(Duration::from_secs(2)).await;
    }
}
