//! Per-tab leader-claim state machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use std::time::Duration;

use concord_bus::EventBus;
use concord_clock::LamportClock;
use concord_message_security::{self as security, Message, NonceCache, SignedMessage, SigningKey};
use concord_types::TabId;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoordError, CoordResult};
use crate::message::{ClaimId, CoordMessage};
use crate::transport::Transport;

/// This tab's view of the coordination state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabState {
    /// Not yet connected to the transport.
    Disconnected,
    /// Registration in flight.
    Connecting,
    /// Registered, neither leading nor following a known leader.
    Registered,
    /// This tab currently holds leadership.
    Leader,
    /// Another tab holds leadership.
    Follower,
}

/// What a resolved [`TabCoordinator::claim_primary`] call found out.
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    /// Whether the claim was granted.
    pub granted: bool,
    /// The tab holding leadership once the claim resolved.
    pub leader_id: TabId,
    /// Present when `granted` is `false`.
    pub reason: Option<String>,
}

/// Tunables for heartbeats, staleness, reconnection and claims.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often this tab emits a heartbeat.
    pub heartbeat_interval: Duration,
    /// A tab with no heartbeat for longer than this is considered gone.
    pub stale_threshold: Duration,
    /// How long `claim_primary` waits for a response before timing out.
    pub claim_timeout: Duration,
    /// Maximum reconnection attempts after a transport closure.
    pub reconnect_attempts: u32,
    /// Fixed delay between reconnection attempts.
    pub reconnect_backoff: Duration,
    /// Maximum age of an inbound message before it's rejected as stale.
    pub message_max_age: Duration,
    /// Capacity of the replay-nonce cache.
    pub nonce_cache_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(15),
            claim_timeout: Duration::from_secs(3),
            reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(1000),
            message_max_age: Duration::from_secs(security::DEFAULT_MAX_AGE_SECS),
            nonce_cache_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone)]
struct TabRecord {
    last_heartbeat: Instant,
}

struct PendingClaim {
    responder: oneshot::Sender<ClaimOutcome>,
}

/// Drives one tab's participation in leader-claim coordination.
///
/// Leadership here is a convenience, not a consistency guarantee: each
/// coordinator resolves claims against its own locally observed state, so a
/// pathological pair of concurrent claims from two different tabs can in
/// principle converge on different winners. That's an accepted tradeoff,
/// not a bug — cross-tab strong consistency is out of scope.
pub struct TabCoordinator {
    tab_id: TabId,
    transport: Arc<dyn Transport>,
    clock: LamportClock,
    signing_key: SigningKey,
    nonces: NonceCache,
    config: CoordinatorConfig,
    bus: Option<Arc<EventBus>>,
    state: AsyncMutex<TabState>,
    leader: AsyncMutex<Option<TabId>>,
    tabs: DashMap<TabId, TabRecord>,
    pending_claims: DashMap<ClaimId, PendingClaim>,
    seq: AtomicU64,
}

impl TabCoordinator {
    /// Construct a coordinator for `tab_id` over `transport`.
    pub fn new(
        tab_id: TabId,
        transport: Arc<dyn Transport>,
        signing_key: SigningKey,
        bus: Option<Arc<EventBus>>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        let nonces = NonceCache::new(config.nonce_cache_capacity);
        Arc::new(Self {
            clock: LamportClock::new(tab_id.clone()),
            tab_id,
            transport,
            signing_key,
            nonces,
            config,
            bus,
            state: AsyncMutex::new(TabState::Disconnected),
            leader: AsyncMutex::new(None),
            tabs: DashMap::new(),
            pending_claims: DashMap::new(),
            seq: AtomicU64::new(0),
        })
    }

    /// This tab's id.
    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    /// Current state-machine state.
    pub async fn state(&self) -> TabState {
        *self.state.lock().await
    }

    /// The tab currently believed to hold leadership, if any.
    pub async fn current_leader(&self) -> Option<TabId> {
        self.leader.lock().await.clone()
    }

    fn next_nonce(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        format!("{}_{}_{}", self.tab_id, seq, chrono::Utc::now().timestamp_millis())
    }

    fn frame(&self, payload: CoordMessage) -> SignedMessage {
        let stamp = self.clock.stamp();
        let message = Message {
            logical_timestamp: stamp.timestamp,
            sender_id: self.tab_id.clone(),
            nonce: self.next_nonce(),
            timestamp: None,
            payload: serde_json::to_value(&payload).expect("CoordMessage always serializes"),
        };
        security::sign(message, &self.signing_key)
    }

    async fn send(&self, payload: CoordMessage) -> CoordResult<()> {
        self.transport.send(self.frame(payload)).await
    }

    fn emit(&self, name: &str, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            if let Err(err) = bus.publish(name, payload) {
                warn!(event = name, error = %err, "coordinator event publish failed");
            }
        }
    }

    /// Register on the transport and transition to `Registered`. Call once;
    /// reconnection after a transport closure is handled by [`Self::run`].
    pub async fn connect(self: &Arc<Self>) -> CoordResult<()> {
        *self.state.lock().await = TabState::Connecting;
        self.tabs.insert(
            self.tab_id.clone(),
            TabRecord {
                last_heartbeat: Instant::now(),
            },
        );
        self.send(CoordMessage::Register {
            tab_id: self.tab_id.clone(),
        })
        .await?;
        *self.state.lock().await = TabState::Registered;
        self.emit("coordinator:registered", json!({"tabId": self.tab_id.0}));
        Ok(())
    }

    /// Run the coordinator until the transport is permanently closed:
    /// drives the heartbeat loop and the inbound message loop concurrently,
    /// reconnecting with a fixed backoff if the transport closes early.
    pub async fn run(self: Arc<Self>) {
        loop {
            let heartbeat = {
                let this = self.clone();
                tokio::spawn(async move { this.heartbeat_loop().await })
            };
            self.receive_loop().await;
            heartbeat.abort();

            if !self.reconnect().await {
                warn!(tab = %self.tab_id, "coordinator giving up after exhausting reconnection attempts");
                return;
            }
        }
    }

    async fn receive_loop(&self) {
        while let Some(signed) = self.transport.recv().await {
            self.handle_inbound(signed).await;
        }
        *self.state.lock().await = TabState::Disconnected;
        self.reject_all_pending("transport closed");
    }

    async fn heartbeat_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            ticker.tick().await;
            if self
                .send(CoordMessage::Heartbeat { tab_id: self.tab_id.clone() })
                .await
                .is_err()
            {
                return;
            }
            self.evict_stale_tabs().await;
        }
    }

    async fn evict_stale_tabs(&self) {
        let now = Instant::now();
        let stale: Vec<TabId> = self
            .tabs
            .iter()
            .filter(|entry| now.duration_since(entry.last_heartbeat) > self.config.stale_threshold)
            .map(|entry| entry.key().clone())
            .collect();
        for tab in stale {
            self.tabs.remove(&tab);
            let mut leader = self.leader.lock().await;
            if leader.as_ref() == Some(&tab) {
                *leader = None;
                drop(leader);
                let mut state = self.state.lock().await;
                if *state == TabState::Follower {
                    *state = TabState::Registered;
                }
                drop(state);
                info!(tab = %tab, "evicted stale leader, leadership now open");
                self.emit("coordinator:leader_lost", json!({"tabId": tab.0}));
            }
        }
    }

    fn reject_all_pending(&self, reason: &str) {
        let pending: Vec<ClaimId> = self.pending_claims.iter().map(|e| *e.key()).collect();
        for id in pending {
            if let Some((_, entry)) = self.pending_claims.remove(&id) {
                let _ = entry.responder.send(ClaimOutcome {
                    granted: false,
                    leader_id: self.tab_id.clone(),
                    reason: Some(reason.to_string()),
                });
            }
        }
    }

    async fn reconnect(self: &Arc<Self>) -> bool {
        for attempt in 1..=self.config.reconnect_attempts {
            tokio::time::sleep(self.config.reconnect_backoff).await;
            debug!(attempt, "attempting coordinator reconnect");
            if self.connect().await.is_ok() {
                info!(attempt, "coordinator reconnected");
                return true;
            }
        }
        false
    }

    /// Claim leadership. Resolves once the current authority (the tab
    /// presently holding leadership, or whichever tab observes the claim
    /// first if none does) responds, or after `claim_timeout` elapses.
    pub async fn claim_primary(&self) -> CoordResult<ClaimOutcome> {
        let claim_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending_claims.insert(claim_id, PendingClaim { responder: tx });

        if let Err(err) = self
            .send(CoordMessage::ClaimPrimary {
                tab_id: self.tab_id.clone(),
                claim_id,
            })
            .await
        {
            self.pending_claims.remove(&claim_id);
            return Err(err);
        }

        match tokio::time::timeout(self.config.claim_timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(CoordError::TransportClosedDuringClaim(self.tab_id.to_string())),
            Err(_) => {
                self.pending_claims.remove(&claim_id);
                Err(CoordError::ClaimTimeout(self.tab_id.to_string()))
            }
        }
    }

    /// Give up leadership, if held. Best-effort: a failure to notify peers
    /// still transitions local state to `Follower`.
    pub async fn release_primary(&self) {
        let mut leader = self.leader.lock().await;
        if leader.as_ref() == Some(&self.tab_id) {
            *leader = None;
            drop(leader);
            *self.state.lock().await = TabState::Registered;
            let _ = self
                .send(CoordMessage::ReleasePrimary { tab_id: self.tab_id.clone() })
                .await;
            self.emit("coordinator:leader_released", json!({"tabId": self.tab_id.0}));
        }
    }

    async fn handle_inbound(&self, signed: SignedMessage) {
        if let Err(err) = security::process_inbound(
            &signed,
            &self.signing_key,
            &self.nonces,
            self.config.message_max_age,
        ) {
            warn!(error = %err, sender = %signed.message.sender_id, "dropping rejected coordinator message");
            return;
        }
        self.clock.update(signed.message.logical_timestamp);

        let payload: CoordMessage = match serde_json::from_value(signed.message.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "dropping undecodable coordinator payload");
                return;
            }
        };

        match payload {
            CoordMessage::Register { tab_id } => {
                self.tabs.insert(tab_id, TabRecord { last_heartbeat: Instant::now() });
            }
            CoordMessage::Heartbeat { tab_id } => {
                self.tabs
                    .entry(tab_id)
                    .and_modify(|r| r.last_heartbeat = Instant::now())
                    .or_insert(TabRecord { last_heartbeat: Instant::now() });
            }
            CoordMessage::ClaimPrimary { tab_id, claim_id } => self.handle_claim(tab_id, claim_id).await,
            CoordMessage::LeaderGranted { claim_id, leader_id } => self.handle_granted(claim_id, leader_id).await,
            CoordMessage::ClaimRejected { claim_id, reason, current_leader } => {
                self.handle_rejected(claim_id, reason, current_leader).await
            }
            CoordMessage::ReleasePrimary { tab_id } => self.handle_released(tab_id).await,
        }
    }

    async fn handle_claim(&self, claimant: TabId, claim_id: ClaimId) {
        let mut leader = self.leader.lock().await;
        let verdict = match &*leader {
            None => {
                *leader = Some(claimant.clone());
                None
            }
            Some(current) if *current == claimant => None,
            Some(current) => Some(current.clone()),
        };
        drop(leader);

        match verdict {
            None => {
                let _ = self
                    .send(CoordMessage::LeaderGranted { claim_id, leader_id: claimant })
                    .await;
            }
            Some(current) => {
                let _ = self
                    .send(CoordMessage::ClaimRejected {
                        claim_id,
                        reason: "leadership already held".to_string(),
                        current_leader: Some(current),
                    })
                    .await;
            }
        }
    }

    async fn handle_granted(&self, claim_id: ClaimId, leader_id: TabId) {
        if let Some((_, entry)) = self.pending_claims.remove(&claim_id) {
            let _ = entry.responder.send(ClaimOutcome {
                granted: true,
                leader_id: leader_id.clone(),
                reason: None,
            });
        }
        *self.leader.lock().await = Some(leader_id.clone());
        if leader_id == self.tab_id {
            *self.state.lock().await = TabState::Leader;
            self.emit("coordinator:became_leader", json!({"tabId": self.tab_id.0}));
        } else {
            *self.state.lock().await = TabState::Follower;
        }
    }

    async fn handle_rejected(&self, claim_id: ClaimId, reason: String, current_leader: Option<TabId>) {
        if let Some(leader) = &current_leader {
            *self.leader.lock().await = Some(leader.clone());
        }
        if let Some((_, entry)) = self.pending_claims.remove(&claim_id) {
            let _ = entry.responder.send(ClaimOutcome {
                granted: false,
                leader_id: current_leader.clone().unwrap_or_else(|| self.tab_id.clone()),
                reason: Some(reason),
            });
        }
        let mut state = self.state.lock().await;
        if *state != TabState::Leader {
            *state = TabState::Follower;
        }
    }

    async fn handle_released(&self, tab_id: TabId) {
        let mut leader = self.leader.lock().await;
        if leader.as_ref() == Some(&tab_id) {
            *leader = None;
            drop(leader);
            let mut state = self.state.lock().await;
            if *state == TabState::Follower {
                *state = TabState::Registered;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BroadcastTransport;
    use std::time::Duration as StdDuration;

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            heartbeat_interval: StdDuration::from_millis(50),
            stale_threshold: StdDuration::from_millis(200),
            claim_timeout: StdDuration::from_millis(500),
            reconnect_attempts: 2,
            reconnect_backoff: StdDuration::from_millis(10),
            message_max_age: StdDuration::from_secs(30),
            nonce_cache_capacity: 1024,
        }
    }

    fn join(tab: &str, tx: &tokio::sync::broadcast::Sender<SignedMessage>) -> Arc<TabCoordinator> {
        let transport = Arc::new(BroadcastTransport::subscribe(tx));
        TabCoordinator::new(
            TabId::from(tab),
            transport,
            SigningKey::from_bytes(b"shared-test-key".to_vec()),
            None,
            test_config(),
        )
    }

    #[tokio::test]
    async fn a_lone_tab_claims_leadership() {
        let (_tx, root) = BroadcastTransport::new_domain(16);
        let a = TabCoordinator::new(
            TabId::from("a"),
            Arc::new(root),
            SigningKey::from_bytes(b"shared-test-key".to_vec()),
            None,
            test_config(),
        );
        a.connect().await.unwrap();
        tokio::spawn(a.clone().run());

        let outcome = a.claim_primary().await.unwrap();
        assert!(outcome.granted);
        assert_eq!(outcome.leader_id, TabId::from("a"));
    }

    #[tokio::test]
    async fn a_second_claim_is_rejected_once_a_leader_exists() {
        let (tx, root) = BroadcastTransport::new_domain(16);
        let a = TabCoordinator::new(
            TabId::from("a"),
            Arc::new(root),
            SigningKey::from_bytes(b"shared-test-key".to_vec()),
            None,
            test_config(),
        );
        let b = join("b", &tx);

        a.connect().await.unwrap();
        b.connect().await.unwrap();
        tokio::spawn(a.clone().run());
        tokio::spawn(b.clone().run());

        let first = a.claim_primary().await.unwrap();
        assert!(first.granted);

        let second = b.claim_primary().await.unwrap();
        assert!(!second.granted);
        assert_eq!(second.leader_id, TabId::from("a"));
    }

    #[tokio::test]
    async fn release_then_reclaim_succeeds() {
        let (tx, root) = BroadcastTransport::new_domain(16);
        let a = TabCoordinator::new(
            TabId::from("a"),
            Arc::new(root),
            SigningKey::from_bytes(b"shared-test-key".to_vec()),
            None,
            test_config(),
        );
        let b = join("b", &tx);

        a.connect().await.unwrap();
        b.connect().await.unwrap();
        tokio::spawn(a.clone().run());
        tokio::spawn(b.clone().run());

        a.claim_primary().await.unwrap();
        a.release_primary().await;
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let outcome = b.claim_primary().await.unwrap();
        assert!(outcome.granted);
        assert_eq!(outcome.leader_id, TabId::from("b"));
    }
}
