//! Typed domain events published on the in-process bus.
//!
//! Events are transient DTOs, distinct from persisted messages: the processor
//! announces every message it works on, and feature code may subscribe without
//! being wired into the persisted-message registry.

use event_bus::DomainEvent;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::{Direction, Integration, IntegrationMessage};

pub mod topics {
    /// An inbound message was picked up by the processor.
    pub const INBOUND_MESSAGE_RECEIVED: &str = "integration.inbound.received";
    /// An outbound message finished processing.
    pub const OUTBOUND_MESSAGE_PROCESSED: &str = "integration.outbound.processed";
    /// An accounting invoice was confirmed synced by the upstream.
    pub const ACCOUNTING_INVOICE_SYNCED: &str = "accounting.invoice.synced";
}

/// Announcement of an inbound message entering processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessageEvent {
    pub message_id: Uuid,
    pub organization_id: Uuid,
    pub integration: Integration,
    pub event_type: String,
    pub external_reference: String,
}

impl InboundMessageEvent {
    pub fn from_message(message: &IntegrationMessage) -> Self {
        debug_assert_eq!(message.direction, Direction::Inbound);
        Self {
            message_id: message.id,
            organization_id: message.organization_id,
            integration: message.integration,
            event_type: message.event_type.clone(),
            external_reference: message.external_reference.clone(),
        }
    }

    pub fn into_domain_event(self) -> DomainEvent {
        let organization_id = self.organization_id;
        DomainEvent::new(
            topics::INBOUND_MESSAGE_RECEIVED,
            serde_json::to_value(self).unwrap_or(Value::Null),
        )
        .with_organization(organization_id)
    }
}

/// Announcement of an outbound message reaching its terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessageEvent {
    pub message_id: Uuid,
    pub organization_id: Uuid,
    pub integration: Integration,
    pub event_type: String,
    pub external_reference: String,
    pub response: Value,
}

impl OutboundMessageEvent {
    pub fn from_message(message: &IntegrationMessage) -> Self {
        Self {
            message_id: message.id,
            organization_id: message.organization_id,
            integration: message.integration,
            event_type: message.event_type.clone(),
            external_reference: message.external_reference.clone(),
            response: message.response_payload.clone(),
        }
    }

    pub fn into_domain_event(self) -> DomainEvent {
        let organization_id = self.organization_id;
        DomainEvent::new(
            topics::OUTBOUND_MESSAGE_PROCESSED,
            serde_json::to_value(self).unwrap_or(Value::Null),
        )
        .with_organization(organization_id)
    }
}

/// Published when the accounting upstream confirms an invoice document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceSyncedEvent {
    pub organization_id: Uuid,
    pub invoice_id: String,
    pub payload: Value,
    pub source_message_id: Uuid,
    pub event_type: String,
}

impl InvoiceSyncedEvent {
    pub fn into_domain_event(self) -> DomainEvent {
        let organization_id = self.organization_id;
        DomainEvent::new(
            topics::ACCOUNTING_INVOICE_SYNCED,
            serde_json::to_value(self).unwrap_or(Value::Null),
        )
        .with_organization(organization_id)
        .with_metadata(json!({ "source": "accounting" }))
    }
}
