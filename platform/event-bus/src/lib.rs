//! # EventBus
//!
//! In-process publish/subscribe dispatch for domain events.
//!
//! The bus is a **shared runtime capability**: the message processor publishes
//! a domain event for every message it picks up, and feature code subscribes
//! handlers by topic. Dispatch is synchronous on the publisher's task, in
//! subscription order, and handler results are returned to the publisher.
//!
//! Besides fire-and-forget `publish`, the bus supports a request/response
//! pattern: `publish_and_wait` parks a one-shot waiter keyed by the event id,
//! and any handler may fulfil it through `respond_to_request`.
//!
//! ## Usage
//!
//! ```rust
//! use event_bus::{DomainEvent, EventBus, EventHandler, BusResult};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl EventHandler for Echo {
//!     fn name(&self) -> &str { "echo" }
//!     async fn handle(&self, event: &DomainEvent) -> BusResult<serde_json::Value> {
//!         Ok(event.payload.clone())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = EventBus::new();
//! bus.subscribe("orders.received", Arc::new(Echo));
//! let results = bus
//!     .publish(&DomainEvent::new("orders.received", serde_json::json!({"id": 1})))
//!     .await?;
//! assert_eq!(results.len(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

/// A typed in-process event delivered through the bus.
///
/// Distinct from a persisted integration message: events are transient and
/// carry whatever JSON payload the publisher chose to expose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique id of this event instance; also the request/response key.
    pub event_id: Uuid,
    /// Topic the event is published under (e.g. `integration.inbound.received`).
    pub event_type: String,
    /// Tenant the event belongs to, when applicable.
    pub organization_id: Option<Uuid>,
    /// Event body.
    pub payload: Value,
    /// Free-form context (source module, correlation hints).
    pub metadata: Value,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            organization_id: None,
            payload,
            metadata: Value::Null,
        }
    }

    pub fn with_organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    #[error("timed out waiting for a response to event {0}")]
    ResponseTimeout(Uuid),

    #[error("response channel for event {0} was dropped")]
    ResponseDropped(Uuid),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// A subscriber invoked for every event published on its topic.
///
/// Handlers run sequentially on the publisher's task; a handler error aborts
/// the fan-out and propagates to the publisher, which owns error handling.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable identifier used in logs and error reports.
    fn name(&self) -> &str;

    async fn handle(&self, event: &DomainEvent) -> BusResult<Value>;
}

type HandlerList = Vec<Arc<dyn EventHandler>>;

/// In-process topic → handlers dispatcher.
///
/// Subscribe/unsubscribe take a short lock; `publish` snapshots the handler
/// list and runs the handlers without holding it, so handlers may themselves
/// publish further events.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<String, HandlerList>>>,
    waiters: Arc<Mutex<HashMap<Uuid, oneshot::Sender<Value>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to a topic. Idempotent: subscribing the same
    /// handler instance twice keeps a single registration.
    pub fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = subscribers.entry(topic.to_string()).or_default();
        if !bucket.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            tracing::debug!(topic = %topic, handler = %handler.name(), "subscribing handler");
            bucket.push(handler);
        }
    }

    /// Remove a previously subscribed handler instance from a topic.
    pub fn unsubscribe(&self, topic: &str, handler: &Arc<dyn EventHandler>) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bucket) = subscribers.get_mut(topic) {
            bucket.retain(|h| !Arc::ptr_eq(h, handler));
        }
    }

    /// Publish an event to every handler subscribed to its topic.
    ///
    /// Handlers run sequentially in subscription order; the first handler
    /// error aborts the fan-out and is returned to the caller.
    pub async fn publish(&self, event: &DomainEvent) -> BusResult<Vec<Value>> {
        let handlers: HandlerList = {
            let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers
                .get(&event.event_type)
                .cloned()
                .unwrap_or_default()
        };

        tracing::debug!(
            event_type = %event.event_type,
            event_id = %event.event_id,
            handlers = handlers.len(),
            "publishing domain event"
        );

        let mut results = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let result = handler.handle(event).await?;
            results.push(result);
        }
        Ok(results)
    }

    /// Publish an event and block until some handler responds through
    /// [`respond_to_request`](Self::respond_to_request), or the timeout fires.
    pub async fn publish_and_wait(
        &self,
        event: &DomainEvent,
        timeout: Duration,
    ) -> BusResult<Value> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            waiters.insert(event.event_id, tx);
        }

        let publish_result = self.publish(event).await;
        if let Err(e) = publish_result {
            self.discard_waiter(event.event_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(BusError::ResponseDropped(event.event_id)),
            Err(_) => {
                self.discard_waiter(event.event_id);
                Err(BusError::ResponseTimeout(event.event_id))
            }
        }
    }

    /// Fulfil a pending `publish_and_wait` request. A response for an unknown
    /// or already-fulfilled request id is silently dropped.
    pub fn respond_to_request(&self, event_id: Uuid, response: Value) {
        let sender = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            waiters.remove(&event_id)
        };
        if let Some(sender) = sender {
            let _ = sender.send(response);
        }
    }

    fn discard_waiter(&self, event_id: Uuid) {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        waiters.remove(&event_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        label: &'static str,
        calls: AtomicUsize,
    }

    impl Recorder {
        fn new(label: &'static str) -> Arc<Self> {
            Arc::new(Self {
                label,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        async fn handle(&self, _event: &DomainEvent) -> BusResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "handler": self.label }))
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn handle(&self, _event: &DomainEvent) -> BusResult<Value> {
            Err(BusError::Handler {
                handler: "failing".into(),
                message: "boom".into(),
            })
        }
    }

    struct Responder {
        bus: EventBus,
    }

    #[async_trait]
    impl EventHandler for Responder {
        fn name(&self) -> &str {
            "responder"
        }

        async fn handle(&self, event: &DomainEvent) -> BusResult<Value> {
            self.bus
                .respond_to_request(event.event_id, json!({ "answered": true }));
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn publish_runs_handlers_in_subscription_order() {
        let bus = EventBus::new();
        let first = Recorder::new("first");
        let second = Recorder::new("second");
        bus.subscribe("topic.a", first.clone());
        bus.subscribe("topic.a", second.clone());

        let results = bus
            .publish(&DomainEvent::new("topic.a", Value::Null))
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0], json!({ "handler": "first" }));
        assert_eq!(results[1], json!({ "handler": "second" }));
    }

    #[tokio::test]
    async fn duplicate_subscriptions_are_coalesced() {
        let bus = EventBus::new();
        let handler = Recorder::new("dup");
        bus.subscribe("topic.dup", handler.clone());
        bus.subscribe("topic.dup", handler.clone());

        bus.publish(&DomainEvent::new("topic.dup", Value::Null))
            .await
            .unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_handler() {
        let bus = EventBus::new();
        let handler = Recorder::new("gone");
        bus.subscribe("topic.u", handler.clone());
        let as_dyn: Arc<dyn EventHandler> = handler.clone();
        bus.unsubscribe("topic.u", &as_dyn);

        let results = bus
            .publish(&DomainEvent::new("topic.u", Value::Null))
            .await
            .unwrap();

        assert!(results.is_empty());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_error_propagates_and_aborts_fanout() {
        let bus = EventBus::new();
        bus.subscribe("topic.e", Arc::new(Failing));
        let after = Recorder::new("after");
        bus.subscribe("topic.e", after.clone());

        let result = bus.publish(&DomainEvent::new("topic.e", Value::Null)).await;

        assert!(matches!(result, Err(BusError::Handler { .. })));
        assert_eq!(after.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publish_and_wait_returns_first_response() {
        let bus = EventBus::new();
        bus.subscribe("topic.req", Arc::new(Responder { bus: bus.clone() }));

        let response = bus
            .publish_and_wait(
                &DomainEvent::new("topic.req", Value::Null),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(response, json!({ "answered": true }));
    }

    #[tokio::test]
    async fn publish_and_wait_times_out_without_response() {
        let bus = EventBus::new();
        let silent = Recorder::new("silent");
        bus.subscribe("topic.slow", silent);

        let result = bus
            .publish_and_wait(
                &DomainEvent::new("topic.slow", Value::Null),
                Duration::from_millis(20),
            )
            .await;

        assert!(matches!(result, Err(BusError::ResponseTimeout(_))));
    }

    #[tokio::test]
    async fn respond_to_unknown_request_is_a_noop() {
        let bus = EventBus::new();
        bus.respond_to_request(Uuid::new_v4(), Value::Null);
    }
}
