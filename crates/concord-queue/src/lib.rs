#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **concord-queue** – Priority operation queue with a single processor
//! loop, serialized through `concord-lock`.
//!
//! Operations are sorted by priority (descending) with FIFO tie-break on
//! registration order. The processor loop pre-checks the operation's lock
//! via [`concord_lock::LockManager::can_acquire`] before committing to an
//! acquire-with-timeout, so an op that cannot possibly proceed doesn't tie
//! up a claim slot. A body failure classified as retryable is left at the
//! head of the queue (not re-sorted) so it doesn't lose its place to
//! later arrivals — priority inversion in the other direction, where an
//! op that has already waited longest loses out to a fresh higher-priority
//! one, is exactly what the "leave at head" rule avoids.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use concord_bus::EventBus;
use concord_lock::LockManager;
use concord_types::{OperationStatus, Priority};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifier for a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(Uuid);

impl OperationId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors an operation's settled promise may carry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// Cancelled before it ran, or while waiting.
    #[error("operation cancelled")]
    Cancelled,
    /// The lock could not be acquired within its timeout.
    #[error("lock acquisition timed out")]
    LockTimeout,
    /// The pre-check retry cap was exceeded without the lock freeing up.
    #[error("pre-check retry cap exceeded")]
    PrecheckExhausted,
    /// The body itself returned an error.
    #[error("operation failed: {0}")]
    Failed(String),
}

/// Per-operation configuration.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Named lock this operation must hold while its body runs.
    pub lock_name: String,
    /// Maximum number of body attempts before failing permanently.
    pub max_attempts: u32,
    /// Delay between pre-check retries.
    pub retry_delay: Duration,
    /// Timeout for the acquire-with-timeout claim once pre-check passes.
    pub claim_timeout: Duration,
    /// Maximum pre-check retries before the operation fails.
    pub precheck_retry_cap: u32,
}

type OperationBody = Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, QueueError>> + Send>;

struct QueuedOperation {
    id: OperationId,
    name: String,
    priority: Priority,
    seq: u64,
    opts: EnqueueOptions,
    attempts: u32,
    precheck_attempts: u32,
    body: Option<OperationBody>,
    responder: Option<oneshot::Sender<Result<Value, QueueError>>>,
}

fn sort_key(op: &QueuedOperation) -> (std::cmp::Reverse<Priority>, u64) {
    (std::cmp::Reverse(op.priority), op.seq)
}

/// A priority queue of operations processed one at a time by a single
/// background loop, each serialized through a named lock.
pub struct OperationQueue {
    queue: Mutex<VecDeque<QueuedOperation>>,
    statuses: DashMap<OperationId, OperationStatus>,
    locks: Arc<LockManager>,
    bus: Option<Arc<EventBus>>,
    notify: Notify,
    next_seq: AtomicU64,
}

impl OperationQueue {
    /// Build an empty queue over `locks`, optionally publishing lifecycle
    /// events on `bus`.
    pub fn new(locks: Arc<LockManager>, bus: Option<Arc<EventBus>>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            statuses: DashMap::new(),
            locks,
            bus,
            notify: Notify::new(),
            next_seq: AtomicU64::new(0),
        })
    }

    /// Current lifecycle status of an operation, if known.
    pub fn status(&self, id: OperationId) -> Option<OperationStatus> {
        self.statuses.get(&id).map(|s| *s)
    }

    /// Enqueue `body` under `name`/`priority`/`opts`; returns the operation's
    /// id and a receiver that resolves when it settles.
    pub fn enqueue<F>(
        &self,
        name: impl Into<String>,
        priority: Priority,
        opts: EnqueueOptions,
        body: F,
    ) -> (OperationId, oneshot::Receiver<Result<Value, QueueError>>)
    where
        F: FnOnce() -> BoxFuture<'static, Result<Value, QueueError>> + Send + 'static,
    {
        let id = OperationId::generate();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        let (tx, rx) = oneshot::channel();

        let op = QueuedOperation {
            id,
            name: name.clone(),
            priority,
            seq,
            opts,
            attempts: 0,
            precheck_attempts: 0,
            body: Some(Box::new(body)),
            responder: Some(tx),
        };

        self.statuses.insert(id, OperationStatus::Pending);
        self.insert_sorted(op);
        self.publish("queue:queued", id, &name);
        self.notify.notify_one();

        (id, rx)
    }

    fn insert_sorted(&self, op: QueuedOperation) {
        let mut queue = self.queue.lock();
        let key = sort_key(&op);
        let pos = queue.iter().position(|existing| sort_key(existing) > key).unwrap_or(queue.len());
        queue.insert(pos, op);
    }

    /// Cancel a pending operation. No-op if it is not currently queued
    /// (already processing, or already settled).
    pub fn cancel(&self, id: OperationId) {
        let removed = {
            let mut queue = self.queue.lock();
            let pos = queue.iter().position(|op| op.id == id);
            pos.and_then(|pos| queue.remove(pos))
        };
        if let Some(mut op) = removed {
            self.statuses.insert(id, OperationStatus::Cancelled);
            if let Some(responder) = op.responder.take() {
                let _ = responder.send(Err(QueueError::Cancelled));
            }
            self.publish("queue:cancelled", id, &op.name);
        }
    }

    /// Cancel every pending operation registered under `name`.
    pub fn cancel_all(&self, name: &str) {
        let removed: Vec<_> = {
            let mut queue = self.queue.lock();
            let mut removed = Vec::new();
            queue.retain(|op| {
                if op.name == name {
                    removed.push(op.id);
                    false
                } else {
                    true
                }
            });
            removed
        };
        for id in removed {
            // Already removed from the queue above; re-run cancel's
            // bookkeeping (status + responder) for each.
            self.statuses.insert(id, OperationStatus::Cancelled);
            self.publish("queue:cancelled", id, name);
        }
    }

    fn publish(&self, event: &str, id: OperationId, name: &str) {
        if let Some(bus) = &self.bus {
            let _ = bus.publish(event, serde_json::json!({ "id": id.to_string(), "name": name }));
        }
    }

    /// Run the processor loop. Intended to be spawned once as a background
    /// task over an `Arc<OperationQueue>`.
    pub async fn run(self: Arc<Self>) {
        loop {
            let current = self.queue.lock().pop_front();
            let Some(mut op) = current else {
                self.notify.notified().await;
                continue;
            };

            let check = self.locks.can_acquire(&op.opts.lock_name);
            if !check.can_acquire {
                op.precheck_attempts += 1;
                if op.precheck_attempts > op.opts.precheck_retry_cap {
                    self.settle_failure(op, QueueError::PrecheckExhausted);
                    continue;
                }
                let retry_delay = op.opts.retry_delay;
                tokio::time::sleep(retry_delay).await;
                self.insert_sorted(op);
                continue;
            }

            self.statuses.insert(op.id, OperationStatus::Processing);
            self.publish("queue:processing", op.id, &op.name);

            match self
                .locks
                .acquire_with_timeout(&op.opts.lock_name, op.opts.claim_timeout)
                .await
            {
                Ok(token) => {
                    let body = op.body.take().expect("body present until consumed exactly once");
                    let result = body().await;
                    self.locks.release(&op.opts.lock_name, token);
                    match result {
                        Ok(value) => self.settle_success(op, value),
                        Err(err) => self.handle_failure(op, err),
                    }
                }
                Err(_) => self.handle_failure(op, QueueError::LockTimeout),
            }
        }
    }

    fn handle_failure(&self, mut op: QueuedOperation, err: QueueError) {
        op.attempts += 1;
        let retryable = matches!(err, QueueError::LockTimeout);
        if retryable && op.attempts < op.opts.max_attempts {
            debug!(op = %op.id, attempts = op.attempts, "retryable failure, leaving operation at head");
            self.queue.lock().push_front(op);
            self.notify.notify_one();
        } else {
            self.settle_failure(op, err);
        }
    }

    fn settle_success(&self, mut op: QueuedOperation, value: Value) {
        self.statuses.insert(op.id, OperationStatus::Completed);
        if let Some(responder) = op.responder.take() {
            let _ = responder.send(Ok(value));
        }
        self.publish("queue:completed", op.id, &op.name);
    }

    fn settle_failure(&self, mut op: QueuedOperation, err: QueueError) {
        warn!(op = %op.id, error = %err, "operation failed");
        self.statuses.insert(op.id, OperationStatus::Failed);
        if let Some(responder) = op.responder.take() {
            let _ = responder.send(Err(err));
        }
        self.publish("queue:failed", op.id, &op.name);
    }

    /// Number of operations currently queued (not counting one in-flight).
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn default_opts(lock_name: &str) -> EnqueueOptions {
        EnqueueOptions {
            lock_name: lock_name.to_string(),
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
            claim_timeout: Duration::from_millis(50),
            precheck_retry_cap: 10,
        }
    }

    #[tokio::test]
    async fn enqueued_operation_runs_and_resolves() {
        let locks = Arc::new(LockManager::new());
        let queue = OperationQueue::new(locks, None);
        tokio::spawn(queue.clone().run());

        let (_id, rx) = queue.enqueue("test", Priority::Normal, default_opts("a"), || {
            Box::pin(async { Ok(json!({"done": true})) })
        });

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result["done"], true);
    }

    #[tokio::test]
    async fn higher_priority_runs_before_lower_when_both_queued() {
        let locks = Arc::new(LockManager::new());
        let queue = OperationQueue::new(locks, None);

        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let (_id_low, rx_low) = queue.enqueue("low", Priority::Low, default_opts("lock"), move || {
            Box::pin(async move {
                o1.lock().push("low");
                Ok(json!(null))
            })
        });
        let o2 = order.clone();
        let (_id_high, rx_high) = queue.enqueue("high", Priority::Critical, default_opts("lock"), move || {
            Box::pin(async move {
                o2.lock().push("high");
                Ok(json!(null))
            })
        });

        tokio::spawn(queue.clone().run());
        rx_low.await.unwrap().unwrap();
        rx_high.await.unwrap().unwrap();

        assert_eq!(*order.lock(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn cancel_rejects_a_pending_operation() {
        let locks = Arc::new(LockManager::new());
        let queue = OperationQueue::new(locks.clone(), None);

        // Hold the lock so the enqueued op stays pending.
        let held = locks.acquire("lock").await;

        let (id, rx) = queue.enqueue("test", Priority::Normal, default_opts("lock"), || {
            Box::pin(async { Ok(json!(null)) })
        });
        tokio::spawn(queue.clone().run());

        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.cancel(id);

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(QueueError::Cancelled)));
        locks.release("lock", held);
    }

    #[tokio::test]
    async fn precheck_exhaustion_fails_the_operation() {
        let locks = Arc::new(LockManager::new());
        let _held = locks.acquire("busy").await;
        let queue = OperationQueue::new(locks.clone(), None);

        let mut opts = default_opts("busy");
        opts.precheck_retry_cap = 1;
        opts.retry_delay = Duration::from_millis(5);

        let (_id, rx) = queue.enqueue("test", Priority::Normal, opts, || Box::pin(async { Ok(json!(null)) }));
        tokio::spawn(queue.clone().run());

        let result = tokio::time::timeout(Duration::from_millis(500), rx).await.unwrap().unwrap();
        assert!(matches!(result, Err(QueueError::PrecheckExhausted)));
    }
}
