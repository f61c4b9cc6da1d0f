#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **concord-degradation** – Tier-driven degradation controller.
//!
//! Subscribes (conceptually; callers drive it explicitly via
//! [`DegradationController::on_tier_change`] and
//! [`DegradationController::on_connection_failure`]) to quota tier
//! evaluations from `concord-quota` and storage connection failures,
//! maintaining `readOnly`/`emergency` mode flags and dispatching
//! tier-appropriate cleanup through the [`CleanupRegistry`].

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use concord_bus::EventBus;
use concord_types::{CleanupPriority, QuotaTier};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Which category-specific age cutoff a cleanup pass should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The gentler, "normal" age cutoffs.
    Normal,
    /// The tighter, "critical" age cutoffs.
    Critical,
}

/// Category of a cleanable item, driving its category-specific cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupCategory {
    /// A stored chat/work session.
    Session,
    /// A content chunk.
    Chunk,
    /// A buffered stream.
    Stream,
    /// An embedding cache entry.
    Embedding,
}

fn age_cutoff(category: CleanupCategory, severity: Severity) -> Option<ChronoDuration> {
    match (category, severity) {
        (CleanupCategory::Session, Severity::Normal) => Some(ChronoDuration::days(30)),
        (CleanupCategory::Session, Severity::Critical) => Some(ChronoDuration::days(7)),
        (CleanupCategory::Chunk, Severity::Normal) => Some(ChronoDuration::days(90)),
        (CleanupCategory::Chunk, Severity::Critical) => Some(ChronoDuration::days(30)),
        (CleanupCategory::Stream, Severity::Normal) => Some(ChronoDuration::days(30)),
        (CleanupCategory::Stream, Severity::Critical) => Some(ChronoDuration::days(7)),
        (CleanupCategory::Embedding, _) => None,
    }
}

/// A single cleanable item registered with the [`CleanupRegistry`].
#[derive(Debug, Clone)]
pub struct CleanupItem {
    /// Key identifying this item within its store.
    pub key: String,
    /// Object store the item lives in.
    pub store: String,
    /// Cleanup priority.
    pub priority: CleanupPriority,
    /// Category, driving the age cutoff applied during cleanup.
    pub category: CleanupCategory,
    /// When the item was last accessed.
    pub last_accessed: DateTime<Utc>,
    /// Size of the item in bytes.
    pub size_bytes: u64,
    /// Session items only: whether this is the currently active session,
    /// which is never deleted regardless of age or priority.
    pub active: bool,
}

/// Outcome of a single cleanup pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupOutcome {
    /// Keys removed, as `(store, key)` pairs.
    pub removed: Vec<(String, String)>,
    /// Total bytes freed.
    pub freed_bytes: u64,
}

/// Registry of cleanable items across all stores.
#[derive(Default)]
pub struct CleanupRegistry {
    items: Mutex<Vec<CleanupItem>>,
}

impl CleanupRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an item.
    pub fn register(&self, item: CleanupItem) {
        let mut items = self.items.lock();
        items.retain(|existing| !(existing.store == item.store && existing.key == item.key));
        items.push(item);
    }

    /// Remove an item from the registry without running cleanup on it (the
    /// caller already deleted it from the store directly).
    pub fn deregister(&self, store: &str, key: &str) {
        self.items.lock().retain(|i| !(i.store == store && i.key == key));
    }

    /// Items eligible for cleanup at `min_priority` or above, excluding
    /// `CleanupPriority::NeverDelete`, sorted by priority descending then
    /// `last_accessed` ascending (oldest first).
    fn candidates(&self, min_priority: CleanupPriority) -> Vec<CleanupItem> {
        let mut items: Vec<_> = self
            .items
            .lock()
            .iter()
            .filter(|i| i.priority != CleanupPriority::NeverDelete && i.priority >= min_priority)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.last_accessed.cmp(&b.last_accessed)));
        items
    }

    /// Run a cleanup pass at `min_priority` and `severity`, stopping once
    /// freed bytes exceed 10% of `current_usage_bytes` or candidates run
    /// out. Session items flagged `active` are never removed.
    pub fn run_cleanup(
        &self,
        min_priority: CleanupPriority,
        severity: Severity,
        current_usage_bytes: u64,
    ) -> CleanupOutcome {
        let stop_at = current_usage_bytes / 10;
        let now = Utc::now();
        let mut outcome = CleanupOutcome::default();

        for item in self.candidates(min_priority) {
            if outcome.freed_bytes > stop_at {
                break;
            }
            if item.category == CleanupCategory::Session && item.active {
                continue;
            }
            if let Some(cutoff) = age_cutoff(item.category, severity) {
                if now.signed_duration_since(item.last_accessed) < cutoff {
                    continue;
                }
            }
            self.deregister(&item.store, &item.key);
            outcome.freed_bytes += item.size_bytes;
            outcome.removed.push((item.store, item.key));
        }

        outcome
    }
}

/// Mode flags driven by tier transitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct DegradationState {
    /// Storage is currently read-only.
    pub read_only: bool,
    /// Emergency mode is active.
    pub emergency: bool,
    /// The tier last observed.
    pub tier: Option<QuotaTier>,
}

/// Drives UI/storage events and cleanup dispatch from quota tier
/// transitions and storage connection failures.
pub struct DegradationController {
    state: Mutex<DegradationState>,
    registry: Arc<CleanupRegistry>,
    bus: Option<Arc<EventBus>>,
}

impl DegradationController {
    /// Build a controller over `registry`, optionally publishing events on
    /// `bus`.
    pub fn new(registry: Arc<CleanupRegistry>, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            state: Mutex::new(DegradationState::default()),
            registry,
            bus,
        }
    }

    /// Current mode flags.
    pub fn state(&self) -> DegradationState {
        *self.state.lock()
    }

    fn emit(&self, event: &str, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            let _ = bus.publish(event, payload);
        }
    }

    /// React to a tier change reported by `concord-quota`'s evaluation.
    /// `usage_bytes` is the current reported usage, used to size cleanup
    /// passes.
    pub fn on_tier_change(&self, new_tier: QuotaTier, usage_bytes: u64) {
        {
            let mut state = self.state.lock();
            if state.tier == Some(new_tier) {
                return;
            }
            state.tier = Some(new_tier);
        }

        match new_tier {
            QuotaTier::Warning => {
                self.emit(
                    "ui:toast",
                    serde_json::json!({"level": "warning", "message": "Storage usage is high."}),
                );
                self.emit(
                    "lru:eviction_policy",
                    serde_json::json!({"mode": "aggressive", "targetRatio": 0.7}),
                );
                self.registry.run_cleanup(CleanupPriority::High, Severity::Normal, usage_bytes);
            }
            QuotaTier::Critical => {
                self.emit(
                    "ui:toast",
                    serde_json::json!({
                        "level": "error",
                        "message": "Storage usage is critical.",
                        "actions": ["free_space", "export"],
                    }),
                );
                self.state.lock().read_only = true;
                self.emit("storage:read_only_mode", serde_json::json!({"enabled": true}));
                self.registry
                    .run_cleanup(CleanupPriority::Aggressive, Severity::Critical, usage_bytes);
            }
            QuotaTier::Exceeded => {
                let outcome =
                    self.registry.run_cleanup(CleanupPriority::Low, Severity::Critical, usage_bytes);
                if outcome.freed_bytes == 0 {
                    self.on_tier_change(QuotaTier::Emergency, usage_bytes);
                    return;
                }
            }
            QuotaTier::Emergency => {
                self.state.lock().emergency = true;
                self.emit("storage:pause_non_critical", serde_json::json!({}));
                self.emit(
                    "ui:modal",
                    serde_json::json!({
                        "kind": "emergency",
                        "options": ["clear_old_data", "export_and_clear", "continue_session_only"],
                    }),
                );
            }
            QuotaTier::Normal => {
                let mut state = self.state.lock();
                state.read_only = false;
                state.emergency = false;
                drop(state);
                self.emit("storage:resume_non_critical", serde_json::json!({}));
                self.emit("storage:read_only_mode", serde_json::json!({"enabled": false}));
                self.emit(
                    "lru:eviction_policy",
                    serde_json::json!({"mode": "normal", "targetRatio": 1.0}),
                );
            }
        }
    }

    /// React to a hard storage connection failure: forces `Emergency`
    /// regardless of usage percentage, and surfaces a session-only
    /// continuation path.
    pub fn on_connection_failure(&self) {
        let mut state = self.state.lock();
        state.tier = Some(QuotaTier::Emergency);
        state.emergency = true;
        drop(state);
        self.emit("storage:session_only_mode", serde_json::json!({"reason": "connection_failed"}));
        self.emit(
            "ui:modal",
            serde_json::json!({
                "kind": "emergency",
                "reason": "connection_failed",
                "options": ["clear_old_data", "export_and_clear", "continue_session_only"],
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(store: &str, key: &str, priority: CleanupPriority, category: CleanupCategory, age_days: i64, size: u64) -> CleanupItem {
        CleanupItem {
            key: key.to_string(),
            store: store.to_string(),
            priority,
            category,
            last_accessed: Utc::now() - ChronoDuration::days(age_days),
            size_bytes: size,
            active: false,
        }
    }

    #[test]
    fn never_delete_items_are_excluded_from_candidates() {
        let registry = CleanupRegistry::new();
        registry.register(item("sessions", "s1", CleanupPriority::NeverDelete, CleanupCategory::Session, 100, 10));
        let outcome = registry.run_cleanup(CleanupPriority::Low, Severity::Critical, 1000);
        assert!(outcome.removed.is_empty());
    }

    #[test]
    fn active_session_is_never_removed_even_if_old() {
        let registry = CleanupRegistry::new();
        let mut active = item("sessions", "s1", CleanupPriority::Aggressive, CleanupCategory::Session, 400, 100);
        active.active = true;
        registry.register(active);
        let outcome = registry.run_cleanup(CleanupPriority::Low, Severity::Critical, 1000);
        assert!(outcome.removed.is_empty());
    }

    #[test]
    fn items_younger_than_cutoff_are_kept() {
        let registry = CleanupRegistry::new();
        registry.register(item("chunks", "c1", CleanupPriority::High, CleanupCategory::Chunk, 5, 100));
        let outcome = registry.run_cleanup(CleanupPriority::Low, Severity::Normal, 1000);
        assert!(outcome.removed.is_empty());
    }

    #[test]
    fn items_older_than_cutoff_are_removed_and_bytes_tallied() {
        let registry = CleanupRegistry::new();
        registry.register(item("chunks", "c1", CleanupPriority::High, CleanupCategory::Chunk, 100, 50));
        let outcome = registry.run_cleanup(CleanupPriority::Low, Severity::Critical, 1000);
        assert_eq!(outcome.freed_bytes, 50);
        assert_eq!(outcome.removed, vec![("chunks".to_string(), "c1".to_string())]);
    }

    #[test]
    fn cleanup_stops_once_freed_exceeds_ten_percent_of_usage() {
        let registry = CleanupRegistry::new();
        for i in 0..5 {
            registry.register(item("chunks", &format!("c{i}"), CleanupPriority::High, CleanupCategory::Chunk, 400, 30));
        }
        let outcome = registry.run_cleanup(CleanupPriority::Low, Severity::Critical, 100);
        // stop_at = 10; first item (30 bytes) already exceeds it, so exactly one item is removed.
        assert_eq!(outcome.removed.len(), 1);
    }

    #[test]
    fn embedding_items_ignore_age_and_clear_whenever_candidate() {
        let registry = CleanupRegistry::new();
        registry.register(item("embeddings", "e1", CleanupPriority::High, CleanupCategory::Embedding, 0, 20));
        let outcome = registry.run_cleanup(CleanupPriority::Low, Severity::Normal, 1000);
        assert_eq!(outcome.freed_bytes, 20);
    }

    #[test]
    fn warning_tier_sets_no_flags_but_critical_sets_read_only() {
        let registry = Arc::new(CleanupRegistry::new());
        let controller = DegradationController::new(registry, None);

        controller.on_tier_change(QuotaTier::Warning, 1000);
        assert!(!controller.state().read_only);

        controller.on_tier_change(QuotaTier::Critical, 1000);
        assert!(controller.state().read_only);
    }

    #[test]
    fn normal_tier_clears_both_flags() {
        let registry = Arc::new(CleanupRegistry::new());
        let controller = DegradationController::new(registry, None);
        controller.on_tier_change(QuotaTier::Critical, 1000);
        controller.on_tier_change(QuotaTier::Normal, 0);
        let state = controller.state();
        assert!(!state.read_only);
        assert!(!state.emergency);
    }

    #[test]
    fn connection_failure_forces_emergency() {
        let registry = Arc::new(CleanupRegistry::new());
        let controller = DegradationController::new(registry, None);
        controller.on_connection_failure();
        assert!(controller.state().emergency);
        assert_eq!(controller.state().tier, Some(QuotaTier::Emergency));
    }
}
