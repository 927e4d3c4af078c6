//! Registry of handlers for persisted integration messages.
//!
//! Distinct from the event bus: the bus carries transient domain events, the
//! registry routes durable message rows by `(integration, event_type)`.
//! Registration happens once during startup wiring; afterwards the registry is
//! frozen behind an `Arc` and reads take no lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::IntegrationResult;
use crate::models::{Integration, IntegrationMessage};

/// A handler invoked by the processor for a matching message.
///
/// Handlers return a JSON-serializable result; errors propagate to the
/// processor, which owns classification and retry scheduling.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Stable identifier used in logs and result summaries.
    fn name(&self) -> &'static str;

    async fn handle(&self, message: &IntegrationMessage) -> IntegrationResult<Value>;
}

type HandlerList = Vec<Arc<dyn MessageHandler>>;

/// Two-level dispatch table: integration → event type (or wildcard) → handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Integration, HashMap<Option<String>, HandlerList>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an exact event type, or for every event of the
    /// integration when `event_type` is `None`. Duplicate registrations of
    /// the same handler instance under one key are coalesced.
    pub fn register(
        &mut self,
        integration: Integration,
        event_type: Option<&str>,
        handler: Arc<dyn MessageHandler>,
    ) {
        let bucket = self
            .handlers
            .entry(integration)
            .or_default()
            .entry(event_type.map(str::to_string))
            .or_default();
        if !bucket.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            bucket.push(handler);
        }
    }

    /// Run the handlers registered for `(integration, event_type)`: exact
    /// matches first, then the integration's wildcard handlers, in
    /// registration order. Handlers of other integrations never run. The
    /// first handler error aborts the dispatch and propagates.
    pub async fn dispatch(
        &self,
        integration: Integration,
        event_type: &str,
        message: &IntegrationMessage,
    ) -> IntegrationResult<Vec<Value>> {
        let Some(by_event) = self.handlers.get(&integration) else {
            return Ok(Vec::new());
        };

        let mut selected: HandlerList = Vec::new();
        if !event_type.is_empty() {
            if let Some(exact) = by_event.get(&Some(event_type.to_string())) {
                selected.extend(exact.iter().cloned());
            }
        }
        if let Some(wildcard) = by_event.get(&None) {
            selected.extend(wildcard.iter().cloned());
        }

        let mut results = Vec::with_capacity(selected.len());
        for handler in selected {
            tracing::debug!(
                handler = handler.name(),
                integration = %integration,
                event_type = %event_type,
                message_id = %message.id,
                "dispatching message handler"
            );
            results.push(handler.handle(message).await?);
        }
        Ok(results)
    }
}
