#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **concord-quota** – Byte-quota accounting, write reservations and
//! tier-boundary evaluation.
//!
//! Tracks `{used, quota}` as reported by the storage backend, computes the
//! current usage percentage, and answers `check_write_fits` with a
//! reservation that debits the available budget until it is released or
//! expires. Tier boundaries are only ever crossed by [`QuotaManager::evaluate`],
//! which is the sole place a `storage:tier_change` event is published.

use std::sync::Arc;
use std::time::{Duration, Instant};

use concord_bus::EventBus;
use concord_types::QuotaTier;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// Opaque handle to a write-byte reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId(Uuid);

impl ReservationId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Configurable tier boundaries, as fractions of `quota`.
#[derive(Debug, Clone, Copy)]
pub struct TierBoundaries {
    /// Usage fraction at which `Normal` becomes `Warning`.
    pub warning: f64,
    /// Usage fraction at which `Warning` becomes `Critical`.
    pub critical: f64,
    /// Usage fraction at which `Critical` becomes `Exceeded`.
    pub exceeded: f64,
}

impl Default for TierBoundaries {
    fn default() -> Self {
        Self {
            warning: 0.75,
            critical: 0.90,
            exceeded: 0.95,
        }
    }
}

impl TierBoundaries {
    fn tier_for(&self, percent: f64) -> QuotaTier {
        if percent > 1.0 {
            QuotaTier::Emergency
        } else if percent >= self.exceeded {
            QuotaTier::Exceeded
        } else if percent >= self.critical {
            QuotaTier::Critical
        } else if percent >= self.warning {
            QuotaTier::Warning
        } else {
            QuotaTier::Normal
        }
    }
}

/// A point-in-time snapshot of quota usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaStatus {
    /// Bytes reported as used by the backend.
    pub used_bytes: u64,
    /// Bytes reported as the total quota.
    pub quota_bytes: u64,
    /// `used_bytes / quota_bytes`.
    pub used_percent: f64,
    /// The tier as of the last [`QuotaManager::evaluate`] call.
    pub tier: QuotaTier,
    /// Sum of all currently outstanding reservations, in bytes.
    pub pending_reservations: u64,
}

/// Outcome of [`QuotaManager::check_write_fits`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteCheckResult {
    /// Whether the write fits within the remaining budget.
    pub fits: bool,
    /// The tier at the time of the check.
    pub status: QuotaTier,
    /// A debiting reservation, present only when `fits` is true.
    pub reservation_id: Option<ReservationId>,
    /// Why the write was rejected, present only when `fits` is false.
    pub reason: Option<String>,
}

struct Reservation {
    bytes: u64,
    expires_at: Instant,
}

struct Inner {
    used_bytes: u64,
    quota_bytes: u64,
    tier: QuotaTier,
    reservations: std::collections::HashMap<ReservationId, Reservation>,
}

/// Tracks byte usage against a quota and issues debiting reservations for
/// prospective writes.
pub struct QuotaManager {
    inner: Mutex<Inner>,
    boundaries: TierBoundaries,
    reservation_ttl: Duration,
    bus: Option<Arc<EventBus>>,
}

impl QuotaManager {
    /// Create a manager with the given tier boundaries and reservation
    /// time-to-live, optionally wired to an [`EventBus`] for tier-change
    /// events.
    pub fn new(boundaries: TierBoundaries, reservation_ttl: Duration, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                used_bytes: 0,
                quota_bytes: u64::MAX,
                tier: QuotaTier::Normal,
                reservations: std::collections::HashMap::new(),
            }),
            boundaries,
            reservation_ttl,
            bus,
        }
    }

    /// Update the usage figures reported by the backend. Does not itself
    /// change the observable tier; call [`Self::evaluate`] to do that.
    pub fn report_usage(&self, used_bytes: u64, quota_bytes: u64) {
        let mut inner = self.inner.lock();
        inner.used_bytes = used_bytes;
        inner.quota_bytes = quota_bytes.max(1);
    }

    /// Current usage snapshot including the last-evaluated tier.
    pub fn status(&self) -> QuotaStatus {
        let inner = self.inner.lock();
        self.status_locked(&inner)
    }

    fn status_locked(&self, inner: &Inner) -> QuotaStatus {
        let pending: u64 = inner.reservations.values().map(|r| r.bytes).sum();
        QuotaStatus {
            used_bytes: inner.used_bytes,
            quota_bytes: inner.quota_bytes,
            used_percent: inner.used_bytes as f64 / inner.quota_bytes as f64,
            tier: inner.tier,
            pending_reservations: pending,
        }
    }

    /// Recompute the tier from current usage; if it differs from the
    /// previously recorded tier, updates it and publishes
    /// `storage:tier_change` on the bus (if one was provided).
    pub fn evaluate(&self) -> QuotaTier {
        let mut inner = self.inner.lock();
        self.expire_reservations(&mut inner);
        let percent = inner.used_bytes as f64 / inner.quota_bytes as f64;
        let new_tier = self.boundaries.tier_for(percent);
        let old_tier = inner.tier;
        if new_tier != old_tier {
            inner.tier = new_tier;
            info!(?old_tier, ?new_tier, percent, "quota tier changed");
            if let Some(bus) = &self.bus {
                let _ = bus.publish(
                    "storage:tier_change",
                    serde_json::json!({
                        "oldTier": format!("{:?}", old_tier).to_lowercase(),
                        "newTier": format!("{:?}", new_tier).to_lowercase(),
                        "reason": "evaluate",
                    }),
                );
            }
        }
        new_tier
    }

    /// Force the tier to [`QuotaTier::Emergency`] on a backend connection
    /// failure, bypassing the normal percentage computation, and publish the
    /// tier-change event with `reason: "connection_failed"`.
    pub fn force_emergency_connection_failed(&self) {
        let mut inner = self.inner.lock();
        let old_tier = inner.tier;
        if old_tier != QuotaTier::Emergency {
            inner.tier = QuotaTier::Emergency;
            if let Some(bus) = &self.bus {
                let _ = bus.publish(
                    "storage:tier_change",
                    serde_json::json!({
                        "oldTier": format!("{:?}", old_tier).to_lowercase(),
                        "newTier": "emergency",
                        "reason": "connection_failed",
                    }),
                );
            }
        }
    }

    /// Check whether a prospective write of `size` bytes fits in the
    /// remaining budget (`quota - used - pending reservations`). On success,
    /// issues a reservation that debits the budget until released or
    /// expired.
    pub fn check_write_fits(&self, size: u64) -> WriteCheckResult {
        let mut inner = self.inner.lock();
        self.expire_reservations(&mut inner);

        let pending: u64 = inner.reservations.values().map(|r| r.bytes).sum();
        let available = inner.quota_bytes.saturating_sub(inner.used_bytes + pending);
        let status = self.boundaries.tier_for(
            (inner.used_bytes + pending) as f64 / inner.quota_bytes as f64,
        );

        if size <= available {
            let id = ReservationId::generate();
            inner.reservations.insert(
                id,
                Reservation {
                    bytes: size,
                    expires_at: Instant::now() + self.reservation_ttl,
                },
            );
            debug!(bytes = size, reservation = ?id, "write reservation issued");
            WriteCheckResult {
                fits: true,
                status,
                reservation_id: Some(id),
                reason: None,
            }
        } else {
            WriteCheckResult {
                fits: false,
                status,
                reservation_id: None,
                reason: Some(format!(
                    "requested {size} bytes exceeds available budget of {available} bytes"
                )),
            }
        }
    }

    /// Release a reservation early (the write completed and its bytes were
    /// folded into `used_bytes` via [`Self::report_usage`], or it was
    /// abandoned). No-op if the id is unknown or already expired.
    pub fn release_reservation(&self, id: ReservationId) {
        self.inner.lock().reservations.remove(&id);
    }

    fn expire_reservations(&self, inner: &mut Inner) {
        let now = Instant::now();
        inner.reservations.retain(|_, r| r.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> QuotaManager {
        let m = QuotaManager::new(TierBoundaries::default(), Duration::from_secs(30), None);
        m.report_usage(0, 1000);
        m
    }

    #[test]
    fn write_within_budget_fits_and_reserves() {
        let m = manager();
        let result = m.check_write_fits(100);
        assert!(result.fits);
        assert!(result.reservation_id.is_some());
    }

    #[test]
    fn reservation_debits_available_budget() {
        let m = manager();
        m.check_write_fits(900);
        let second = m.check_write_fits(200);
        assert!(!second.fits);
    }

    #[test]
    fn releasing_a_reservation_frees_its_budget() {
        let m = manager();
        let first = m.check_write_fits(900);
        m.release_reservation(first.reservation_id.unwrap());
        let second = m.check_write_fits(200);
        assert!(second.fits);
    }

    #[test]
    fn evaluate_crosses_boundaries_in_order() {
        let m = manager();
        m.report_usage(800, 1000);
        assert_eq!(m.evaluate(), QuotaTier::Warning);

        m.report_usage(920, 1000);
        assert_eq!(m.evaluate(), QuotaTier::Critical);

        m.report_usage(960, 1000);
        assert_eq!(m.evaluate(), QuotaTier::Exceeded);

        m.report_usage(1100, 1000);
        assert_eq!(m.evaluate(), QuotaTier::Emergency);
    }

    #[test]
    fn report_usage_alone_does_not_change_status_tier() {
        let m = manager();
        m.report_usage(999, 1000);
        assert_eq!(m.status().tier, QuotaTier::Normal);
    }

    #[test]
    fn force_emergency_overrides_percentage() {
        let m = manager();
        m.force_emergency_connection_failed();
        assert_eq!(m.status().tier, QuotaTier::Emergency);
    }

    #[test]
    fn tier_change_publishes_event() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        bus.subscribe(
            "storage:tier_change",
            concord_types::Priority::Normal,
            move |e| seen2.lock().push(e.payload.clone()),
        );

        let m = QuotaManager::new(TierBoundaries::default(), Duration::from_secs(30), Some(bus));
        m.report_usage(800, 1000);
        m.evaluate();

        assert_eq!(seen.lock().len(), 1);
    }
}
