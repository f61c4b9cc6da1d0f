#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **concord-bus** – Priority-ordered, in-process publish/subscribe bus.
//!
//! Every other Concord component emits its lifecycle and error events through
//! this crate. Dispatch is synchronous: `publish` walks every matching
//! handler, highest priority first, entirely within the calling task before
//! returning. There is no internal queue — this is a dispatcher, not a
//! message broker.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use concord_types::Priority;
use dashmap::DashMap;
use serde_json::Value;
use tracing::error;

mod schema;

pub use schema::{Schema, SchemaError, SchemaRegistry};

/// Name of a wildcard subscription that receives every published event.
pub const WILDCARD: &str = "*";

/// An event as delivered to a handler.
#[derive(Debug, Clone)]
pub struct Event {
    /// The event name it was published under.
    pub name: String,
    /// The event payload.
    pub payload: Value,
}

/// Opaque handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Errors surfaced by the bus itself (not by handlers, which are always
/// caught and logged rather than propagated).
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The payload did not validate against the event's registered schema.
    #[error("schema validation failed for event '{0}': {1}")]
    SchemaValidation(String, SchemaError),
}

/// Health surface exposed by the bus. Always `ok` — the bus has no internal
/// queue or connection that can degrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BusHealth {
    /// Always `"ok"`.
    pub status: &'static str,
}

type Handler = Box<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    priority: Priority,
    seq: u64,
    handler: Handler,
}

/// Priority-ordered in-process event bus with wildcard subscriptions and a
/// schema registry.
pub struct EventBus {
    handlers: DashMap<String, Vec<Subscription>>,
    wildcard: DashMap<(), Vec<Subscription>>,
    schemas: SchemaRegistry,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an empty bus with no handlers and no registered schemas.
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            wildcard: DashMap::new(),
            schemas: SchemaRegistry::new(),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Register a schema for `name`; future publishes under that name are
    /// validated against it. Replaces any previously registered schema.
    pub fn register_schema(&self, name: impl Into<String>, schema: Schema) {
        self.schemas.register(name, schema);
    }

    /// Subscribe `handler` to `name` at `priority`. Pass [`WILDCARD`] to
    /// receive every event, delivered after that event's name-specific
    /// handlers.
    pub fn subscribe<F>(&self, name: &str, priority: Priority, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let sub = Subscription {
            id,
            priority,
            seq,
            handler: Box::new(handler),
        };
        if name == WILDCARD {
            let mut entry = self.wildcard.entry(()).or_default();
            insert_sorted(&mut entry, sub);
        } else {
            let mut entry = self.handlers.entry(name.to_string()).or_default();
            insert_sorted(&mut entry, sub);
        }
        id
    }

    /// Remove a previously registered subscription. No-op if it is not
    /// found under `name` or `*`.
    pub fn unsubscribe(&self, name: &str, id: SubscriptionId) {
        if name == WILDCARD {
            if let Some(mut subs) = self.wildcard.get_mut(&()) {
                subs.retain(|s| s.id != id);
            }
        } else if let Some(mut subs) = self.handlers.get_mut(name) {
            subs.retain(|s| s.id != id);
        }
    }

    /// Publish `payload` under `name`. Dispatches to name-specific handlers
    /// in priority-then-registration order, then to wildcard handlers in the
    /// same order, entirely before returning. A handler that panics is
    /// caught and logged; dispatch continues to the remaining handlers.
    ///
    /// Events with no registered schema publish unvalidated. Events with a
    /// registered schema that the payload fails return [`BusError`] without
    /// dispatching to any handler.
    pub fn publish(&self, name: &str, payload: Value) -> Result<(), BusError> {
        if let Some(schema) = self.schemas.get(name) {
            schema
                .validate(&payload)
                .map_err(|e| BusError::SchemaValidation(name.to_string(), e))?;
        }

        let event = Event {
            name: name.to_string(),
            payload,
        };

        if let Some(subs) = self.handlers.get(name) {
            dispatch(&subs, &event);
        }
        if let Some(subs) = self.wildcard.get(&()) {
            dispatch(&subs, &event);
        }
        Ok(())
    }

    /// Health surface. Always reports `ok`.
    pub fn health(&self) -> BusHealth {
        BusHealth { status: "ok" }
    }
}

fn dispatch_key(sub: &Subscription) -> (std::cmp::Reverse<Priority>, u64) {
    (std::cmp::Reverse(sub.priority), sub.seq)
}

fn insert_sorted(subs: &mut Vec<Subscription>, sub: Subscription) {
    let key = dispatch_key(&sub);
    let pos = subs.partition_point(|existing| dispatch_key(existing) <= key);
    subs.insert(pos, sub);
}

fn dispatch(subs: &[Subscription], event: &Event) {
    for sub in subs.iter() {
        let handler = AssertUnwindSafe(&sub.handler);
        let event_ref = AssertUnwindSafe(event);
        if let Err(panic) = std::panic::catch_unwind(move || {
            let handler = handler;
            let event_ref = event_ref;
            (handler.0)(event_ref.0)
        }) {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(event = %event.name, %reason, "event handler panicked");
        }
    }
}

/// Shared handle to an [`EventBus`], convenient for cloning into closures and
/// background tasks.
pub type SharedBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&Event) + Send + Sync) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let handler = move |e: &Event| log2.lock().unwrap().push(e.name.clone());
        (log, handler)
    }

    #[test]
    fn dispatches_highest_priority_first_within_same_event() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.subscribe("x", Priority::Low, move |_| o1.lock().unwrap().push("low"));
        let o2 = order.clone();
        bus.subscribe("x", Priority::Critical, move |_| o2.lock().unwrap().push("critical"));
        let o3 = order.clone();
        bus.subscribe("x", Priority::Normal, move |_| o3.lock().unwrap().push("normal"));

        bus.publish("x", serde_json::json!({})).unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["critical", "normal", "low"]);
    }

    #[test]
    fn wildcard_fires_after_name_specific_handlers() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.subscribe("x", Priority::Critical, move |_| o1.lock().unwrap().push("specific"));
        let o2 = order.clone();
        bus.subscribe(WILDCARD, Priority::Critical, move |_| o2.lock().unwrap().push("wildcard"));

        bus.publish("x", serde_json::json!({})).unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["specific", "wildcard"]);
    }

    #[test]
    fn panicking_handler_does_not_block_other_handlers() {
        let bus = EventBus::new();
        let (log, ok_handler) = recorder();

        bus.subscribe("x", Priority::High, |_| panic!("boom"));
        bus.subscribe("x", Priority::Low, ok_handler);

        bus.publish("x", serde_json::json!({})).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["x"]);
    }

    #[test]
    fn unsubscribe_stops_future_delivery() {
        let bus = EventBus::new();
        let (log, handler) = recorder();
        let id = bus.subscribe("x", Priority::Normal, handler);

        bus.publish("x", serde_json::json!({})).unwrap();
        bus.unsubscribe("x", id);
        bus.publish("x", serde_json::json!({})).unwrap();

        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn unknown_event_publishes_without_schema() {
        let bus = EventBus::new();
        assert!(bus.publish("nothing:registered", serde_json::json!(null)).is_ok());
    }

    #[test]
    fn schema_validation_rejects_bad_payload() {
        let bus = EventBus::new();
        bus.register_schema(
            "storage:tier_change",
            Schema::object(&[("oldTier", schema::FieldType::String), ("newTier", schema::FieldType::String)]),
        );

        let bad = bus.publish("storage:tier_change", serde_json::json!({"oldTier": "normal"}));
        assert!(bad.is_err());

        let good = bus.publish(
            "storage:tier_change",
            serde_json::json!({"oldTier": "normal", "newTier": "warning"}),
        );
        assert!(good.is_ok());
    }
}
