#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **concord-lock** – Named mutual-exclusion locks with opaque tokens and
//! FIFO waiters.
//!
//! Each named lock has at most one holder at a time, identified by an
//! opaque [`LockToken`]. Waiters queue FIFO and are granted the lock in
//! arrival order as it is released. [`LockManager::release`] is a
//! defensive no-op when the presented token does not match the current
//! holder.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Opaque proof of lock ownership returned by [`LockManager::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Errors surfaced while acquiring a lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock was not granted within the requested timeout.
    #[error("timed out waiting for lock '{0}'")]
    Timeout(String),
}

/// Result of a non-side-effecting [`LockManager::can_acquire`] check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanAcquire {
    /// Whether the lock is currently free.
    pub can_acquire: bool,
    /// Names of locks currently blocking acquisition (today: just `name`
    /// itself when held, kept as a list so callers checking several names
    /// at once can concatenate results).
    pub blocked_by: Vec<String>,
}

#[derive(Default)]
struct LockState {
    holder: Option<LockToken>,
    waiters: VecDeque<oneshot::Sender<LockToken>>,
}

enum AcquireOutcome {
    Granted(LockToken),
    Pending(oneshot::Receiver<LockToken>),
}

/// Registry of named locks.
#[derive(Default)]
pub struct LockManager {
    locks: DashMap<String, Mutex<LockState>>,
}

impl LockManager {
    /// An empty lock registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn try_or_enqueue(&self, name: &str) -> AcquireOutcome {
        let entry = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(LockState::default()));
        let mut state = entry.lock();
        if state.holder.is_none() {
            let token = LockToken::generate();
            state.holder = Some(token);
            AcquireOutcome::Granted(token)
        } else {
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            AcquireOutcome::Pending(rx)
        }
    }

    /// Acquire `name`, waiting FIFO if it is currently held.
    pub async fn acquire(&self, name: &str) -> LockToken {
        match self.try_or_enqueue(name) {
            AcquireOutcome::Granted(token) => {
                debug!(lock = name, "lock acquired immediately");
                token
            }
            AcquireOutcome::Pending(rx) => rx.await.expect("lock releaser always grants or is replaced"),
        }
    }

    /// Acquire `name`, failing with [`LockError::Timeout`] if it is not
    /// granted within `timeout`.
    pub async fn acquire_with_timeout(&self, name: &str, timeout: Duration) -> Result<LockToken, LockError> {
        match self.try_or_enqueue(name) {
            AcquireOutcome::Granted(token) => Ok(token),
            AcquireOutcome::Pending(rx) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(token)) => Ok(token),
                _ => {
                    warn!(lock = name, "lock acquisition timed out");
                    Err(LockError::Timeout(name.to_string()))
                }
            },
        }
    }

    /// Release `name`. No-op if `token` is not the current holder — a
    /// defense against double-release or a stale token from a previous
    /// acquisition.
    pub fn release(&self, name: &str, token: LockToken) {
        let Some(entry) = self.locks.get(name) else {
            return;
        };
        let mut state = entry.lock();
        if state.holder != Some(token) {
            return;
        }
        loop {
            match state.waiters.pop_front() {
                Some(tx) => {
                    let next = LockToken::generate();
                    if tx.send(next).is_ok() {
                        state.holder = Some(next);
                        return;
                    }
                    // Receiver was dropped (the waiter timed out); try the
                    // next one in line.
                }
                None => {
                    state.holder = None;
                    return;
                }
            }
        }
    }

    /// Check whether `name` could be acquired right now, without side
    /// effects.
    pub fn can_acquire(&self, name: &str) -> CanAcquire {
        match self.locks.get(name) {
            Some(entry) => {
                let state = entry.lock();
                if state.holder.is_none() {
                    CanAcquire {
                        can_acquire: true,
                        blocked_by: Vec::new(),
                    }
                } else {
                    CanAcquire {
                        can_acquire: false,
                        blocked_by: vec![name.to_string()],
                    }
                }
            }
            None => CanAcquire {
                can_acquire: true,
                blocked_by: Vec::new(),
            },
        }
    }

    /// Names of locks currently held by someone. Read-only; used by shutdown
    /// paths to confirm drain completed rather than to force a release.
    pub fn held_locks(&self) -> Vec<String> {
        self.locks
            .iter()
            .filter(|entry| entry.value().lock().holder.is_some())
            .map(|entry| entry.key().clone())
            .collect()
    }
}
