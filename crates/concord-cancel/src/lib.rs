#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **concord-cancel** – Tree-structured cancellation with cascading abort.
//!
//! A [`CancelToken`] may have children; aborting a token aborts every
//! descendant depth-first and runs each node's registered cleanup handlers
//! with the abort reason. A fresh [`CancelRegistry::create`] under a name
//! already in use replaces (and aborts) the previous holder of that name —
//! the same pattern the operation queue relies on when a newer operation
//! supersedes a stale one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken as TokioCancelToken;
use tracing::{debug, trace};

/// Reason a token was aborted.
pub type Reason = String;

type CleanupFn = Box<dyn FnOnce(&str) + Send>;

/// Errors returned by cancellation-tree operations.
#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    /// Attempted to create a child of a token that is already aborted.
    #[error("cannot create a child of an already-aborted token '{0}'")]
    ParentAborted(String),
}

struct Node {
    name: String,
    token: TokioCancelToken,
    aborted: AtomicBool,
    reason: Mutex<Option<Reason>>,
    children: Mutex<Vec<Arc<Node>>>,
    cleanups: Mutex<Vec<(u64, CleanupFn)>>,
    next_cleanup_id: AtomicU64,
    timer_generation: AtomicU64,
}

impl Node {
    fn root(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            token: TokioCancelToken::new(),
            aborted: AtomicBool::new(false),
            reason: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            cleanups: Mutex::new(Vec::new()),
            next_cleanup_id: AtomicU64::new(1),
            timer_generation: AtomicU64::new(0),
        })
    }

    fn child(self: &Arc<Self>, name: impl Into<String>) -> Result<Arc<Self>, CancelError> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(CancelError::ParentAborted(self.name.clone()));
        }
        let child = Arc::new(Self {
            name: name.into(),
            token: self.token.child_token(),
            aborted: AtomicBool::new(false),
            reason: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            cleanups: Mutex::new(Vec::new()),
            next_cleanup_id: AtomicU64::new(1),
            timer_generation: AtomicU64::new(0),
        });
        self.children.lock().push(child.clone());
        Ok(child)
    }

    /// Depth-first abort: this node's own cleanups run first, then each
    /// child's subtree is fully aborted before moving to the next sibling.
    /// A no-op if already aborted.
    fn abort(self: &Arc<Self>, reason: &str) {
        if self
            .aborted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        *self.reason.lock() = Some(reason.to_string());
        self.token.cancel();
        self.timer_generation.fetch_add(1, Ordering::AcqRel);

        let cleanups = std::mem::take(&mut *self.cleanups.lock());
        for (_, cleanup) in cleanups {
            cleanup(reason);
        }
        trace!(token = %self.name, %reason, "token aborted");

        let children = self.children.lock().clone();
        for child in children {
            child.abort(reason);
        }
    }
}

/// A handle into the cancellation tree. Cheap to clone; clones refer to the
/// same underlying node.
#[derive(Clone)]
pub struct CancelToken {
    node: Arc<Node>,
}

impl CancelToken {
    /// This token's name.
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Whether this token has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.node.aborted.load(Ordering::Acquire)
    }

    /// The reason this token was aborted, if it has been.
    pub fn reason(&self) -> Option<Reason> {
        self.node.reason.lock().clone()
    }

    /// A `tokio_util` token that becomes cancelled exactly when this node
    /// is aborted (including via cascading abort from an ancestor), for use
    /// with `tokio::select!`.
    pub fn cancellation(&self) -> TokioCancelToken {
        self.node.token.clone()
    }

    /// Create a child token linked to this one. Aborting `self` aborts the
    /// child (and its own descendants) depth-first. Fails if `self` is
    /// already aborted.
    pub fn child(&self, name: impl Into<String>) -> Result<CancelToken, CancelError> {
        self.node.child(name).map(|node| CancelToken { node })
    }

    /// Register a cleanup handler, run once with the abort reason when this
    /// node is aborted. Returns an id usable with [`Self::remove_cleanup`].
    /// If the token is already aborted, the handler runs immediately.
    pub fn on_cleanup<F>(&self, handler: F) -> u64
    where
        F: FnOnce(&str) + Send + 'static,
    {
        let id = self.node.next_cleanup_id.fetch_add(1, Ordering::Relaxed);
        if self.is_aborted() {
            let reason = self.reason().unwrap_or_default();
            handler(&reason);
            return id;
        }
        self.node.cleanups.lock().push((id, Box::new(handler)));
        id
    }

    /// Remove a previously registered cleanup handler before it fires.
    /// No-op if it already ran or was never registered.
    pub fn remove_cleanup(&self, id: u64) {
        self.node.cleanups.lock().retain(|(h, _)| *h != id);
    }

    /// Abort this token (and cascade to descendants). No-op if already
    /// aborted.
    pub fn abort(&self, reason: impl Into<String>) {
        self.node.abort(&reason.into());
    }

    /// Schedule an automatic abort after `delay` with `reason`, unless the
    /// token is aborted first or the timer is cancelled via the returned
    /// handle.
    pub fn set_timeout(&self, delay: Duration, reason: impl Into<String>) -> TimeoutHandle {
        let generation = self.node.timer_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let node = self.node.clone();
        let reason = reason.into();
        let cancel_token = TokioCancelToken::new();
        let task_cancel = cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if node.timer_generation.load(Ordering::Acquire) == generation {
                        debug!(token = %node.name, "scheduled abort firing");
                        node.abort(&reason);
                    }
                }
                _ = task_cancel.cancelled() => {}
                _ = node.token.cancelled() => {}
            }
        });
        TimeoutHandle { cancel: cancel_token }
    }
}

/// Handle returned by [`CancelToken::set_timeout`]; dropping it does not
/// cancel the timer, call [`Self::cancel`] explicitly.
pub struct TimeoutHandle {
    cancel: TokioCancelToken,
}

impl TimeoutHandle {
    /// Cancel the pending auto-abort.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Registry of named root tokens.
#[derive(Default)]
pub struct CancelRegistry {
    roots: DashMap<String, CancelToken>,
}

impl CancelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            roots: DashMap::new(),
        }
    }

    /// Create a fresh root token named `name`. If a token with that name
    /// already exists, it is aborted first with reason `"Replaced by new
    /// operation"`.
    pub fn create(&self, name: impl Into<String>) -> CancelToken {
        let name = name.into();
        if let Some((_, previous)) = self.roots.remove(&name) {
            previous.abort("Replaced by new operation");
        }
        let token = CancelToken { node: Node::root(name.clone()) };
        self.roots.insert(name, token.clone());
        token
    }

    /// Look up a previously created root token by name.
    pub fn get(&self, name: &str) -> Option<CancelToken> {
        self.roots.get(name).map(|t| t.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn creating_duplicate_name_aborts_previous() {
        let registry = CancelRegistry::new();
        let first = registry.create("op");
        let second = registry.create("op");

        assert!(first.is_aborted());
        assert_eq!(first.reason().as_deref(), Some("Replaced by new operation"));
        assert!(!second.is_aborted());
    }

    #[test]
    fn aborting_parent_cascades_depth_first() {
        let root = CancelToken { node: Node::root("root") };
        let child = root.child("child").unwrap();
        let grandchild = child.child("grandchild").unwrap();

        root.abort("shutdown");

        assert!(child.is_aborted());
        assert!(grandchild.is_aborted());
        assert_eq!(grandchild.reason().as_deref(), Some("shutdown"));
    }

    #[test]
    fn abort_twice_is_a_no_op() {
        let root = CancelToken { node: Node::root("root") };
        root.abort("first");
        root.abort("second");
        assert_eq!(root.reason().as_deref(), Some("first"));
    }

    #[test]
    fn child_of_aborted_token_fails() {
        let root = CancelToken { node: Node::root("root") };
        root.abort("done");
        assert!(matches!(root.child("c"), Err(CancelError::ParentAborted(_))));
    }

    #[test]
    fn cleanup_runs_with_reason_and_can_be_removed() {
        let root = CancelToken { node: Node::root("root") };
        let ran = Arc::new(AtomicUsize::new(0));

        let r1 = ran.clone();
        root.on_cleanup(move |_reason| {
            r1.fetch_add(1, Ordering::SeqCst);
        });

        let r2 = ran.clone();
        let id = root.on_cleanup(move |_reason| {
            r2.fetch_add(100, Ordering::SeqCst);
        });
        root.remove_cleanup(id);

        root.abort("bye");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn set_timeout_aborts_after_delay() {
        let root = CancelToken { node: Node::root("root") };
        root.set_timeout(Duration::from_millis(10), "timed out");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(root.is_aborted());
        assert_eq!(root.reason().as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn cancelling_timeout_handle_prevents_abort() {
        let root = CancelToken { node: Node::root("root") };
        let handle = root.set_timeout(Duration::from_millis(10), "timed out");
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!root.is_aborted());
    }
}
