//! Domain model: enums, row types, the message state machine, and backoff.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Maximum serialized size for `payload` / `response_payload`, enforced on
/// every write. Larger bodies belong in external storage.
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024;

/// Automatic retries per message chain before a failure becomes terminal.
pub const MAX_AUTO_RETRIES: i32 = 3;

/// Exponential backoff with a one-hour cap: 5s, 10s, 20s, ..., 320s, 3600s.
pub fn backoff_delay_seconds(retries: i32) -> i64 {
    let exp = retries.clamp(0, 6) as u32;
    let base = 5i64 * (1i64 << exp);
    base.min(3600)
}

/// Upstream system a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Integration {
    Storefront,
    ErpPos,
    Accounting,
}

impl Integration {
    pub fn as_str(&self) -> &'static str {
        match self {
            Integration::Storefront => "storefront",
            Integration::ErpPos => "erp_pos",
            Integration::Accounting => "accounting",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "storefront" => Some(Integration::Storefront),
            "erp_pos" => Some(Integration::ErpPos),
            "accounting" => Some(Integration::Accounting),
            _ => None,
        }
    }
}

impl std::fmt::Display for Integration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of an integration message.
///
/// `processed` is terminal. `failed` is terminal in place: a failed message
/// is only ever resurrected by creating a successor row in `received`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Received,
    Dispatched,
    Acknowledged,
    Processed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Received => "received",
            MessageStatus::Dispatched => "dispatched",
            MessageStatus::Acknowledged => "acknowledged",
            MessageStatus::Processed => "processed",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "received" => Some(MessageStatus::Received),
            "dispatched" => Some(MessageStatus::Dispatched),
            "acknowledged" => Some(MessageStatus::Acknowledged),
            "processed" => Some(MessageStatus::Processed),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    /// The allowed-transitions table. Same-state updates are not transitions
    /// and are checked separately by the store.
    pub fn can_transition_to(&self, target: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, target),
            (Received, Dispatched)
                | (Received, Failed)
                | (Dispatched, Acknowledged)
                | (Dispatched, Processed)
                | (Dispatched, Failed)
                | (Acknowledged, Processed)
                | (Acknowledged, Failed)
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a single inbound webhook or outbound API call.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationMessage {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub integration: Integration,
    pub direction: Direction,
    pub status: MessageStatus,
    pub event_type: String,
    pub external_reference: String,
    pub payload: Value,
    pub response_payload: Value,
    pub error_code: String,
    pub error_message: String,
    pub retries: i32,
    pub received_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub http_status: Option<i32>,
    pub latency_ms: Option<i32>,
    pub idempotency_key: String,
}

/// Creation parameters for a new message row.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub organization_id: Uuid,
    pub integration: Integration,
    pub direction: Direction,
    pub event_type: String,
    pub external_reference: String,
    pub idempotency_key: String,
    pub payload: Value,
    pub retries: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn inbound(
        organization_id: Uuid,
        integration: Integration,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            organization_id,
            integration,
            direction: Direction::Inbound,
            event_type: event_type.into(),
            external_reference: String::new(),
            idempotency_key: String::new(),
            payload,
            retries: 0,
            next_attempt_at: None,
        }
    }

    pub fn outbound(
        organization_id: Uuid,
        integration: Integration,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            organization_id,
            integration,
            direction: Direction::Outbound,
            event_type: event_type.into(),
            external_reference: String::new(),
            idempotency_key: String::new(),
            payload,
            retries: 0,
            next_attempt_at: None,
        }
    }

    pub fn with_external_reference(mut self, reference: impl Into<String>) -> Self {
        self.external_reference = reference.into();
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }
}

/// Serialized byte size of a JSON value, for the payload cap.
pub fn payload_byte_size(value: &Value) -> usize {
    if value.is_null() {
        return 0;
    }
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

/// Lifecycle of a fulfillment order aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    Pending,
    Processing,
    WaitingStock,
    Fulfilled,
    Failed,
    Returned,
}

impl FulfillmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FulfillmentStatus::Pending => "pending",
            FulfillmentStatus::Processing => "processing",
            FulfillmentStatus::WaitingStock => "waiting_stock",
            FulfillmentStatus::Fulfilled => "fulfilled",
            FulfillmentStatus::Failed => "failed",
            FulfillmentStatus::Returned => "returned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(FulfillmentStatus::Pending),
            "processing" => Some(FulfillmentStatus::Processing),
            "waiting_stock" => Some(FulfillmentStatus::WaitingStock),
            "fulfilled" => Some(FulfillmentStatus::Fulfilled),
            "failed" => Some(FulfillmentStatus::Failed),
            "returned" => Some(FulfillmentStatus::Returned),
            _ => None,
        }
    }
}

impl std::fmt::Display for FulfillmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-order aggregate driven by the fulfillment pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct FulfillmentOrder {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub source: Integration,
    pub order_id: String,
    pub seller_company: String,
    pub distributor_company: String,
    pub status: FulfillmentStatus,
    pub payload: Value,
    pub normalized_order: Value,
    pub fulfillment_payload: Value,
    pub result_payload: Value,
    pub serial_numbers: Value,
    pub sales_order_name: String,
    pub delivery_note_name: String,
    pub delivery_note_submitted_at: Option<DateTime<Utc>>,
    pub return_delivery_note_name: String,
    pub return_delivery_note_submitted_at: Option<DateTime<Utc>>,
    pub return_payload: Value,
    pub backorder_attempts: i32,
    pub last_error_code: String,
    pub last_error_message: String,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub source_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Static source→target item mapping row.
#[derive(Debug, Clone)]
pub struct FulfillmentItemMap {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub source: Integration,
    pub source_company: String,
    pub source_item_code: String,
    pub target_company: String,
    pub target_item_code: String,
    pub warehouse: String,
    pub metadata: Value,
    pub is_active: bool,
}

/// Tenant record; `metadata` carries the per-tenant configuration surface.
#[derive(Debug, Clone)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub metadata: Value,
}

/// Credential bundle for the accounting upstream (basic auth `email:token`).
#[derive(Debug, Clone)]
pub struct AccountingCredential {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub company: String,
    pub email: String,
    pub token: String,
    pub base_url: String,
    pub webhook_secret: String,
    pub number_template_id: Option<i32>,
    pub auto_stamp_on_create: bool,
    pub timeout_s: i32,
    pub max_retries: i32,
    pub metadata: Value,
    pub is_active: bool,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AccountingCredential {
    /// Active and inside its validity window.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        if let Some(from) = self.valid_from {
            if from > now {
                return false;
            }
        }
        if let Some(until) = self.valid_until {
            if until < now {
                return false;
            }
        }
        true
    }

    pub fn basic_auth_token(&self) -> String {
        format!("{}:{}", self.email, self.token)
    }
}

/// Credential bundle for the ERP upstream (`token key:secret` header).
#[derive(Debug, Clone)]
pub struct ErpCredential {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub company: String,
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub timeout_s: i32,
    pub metadata: Value,
    pub is_active: bool,
}

/// Storefront shop registration used by the webhook ingress.
#[derive(Debug, Clone)]
pub struct StorefrontStore {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub shop_domain: String,
    pub webhook_shared_secret: String,
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_doubles_and_clamps() {
        assert_eq!(backoff_delay_seconds(0), 5);
        assert_eq!(backoff_delay_seconds(1), 10);
        assert_eq!(backoff_delay_seconds(2), 20);
        assert_eq!(backoff_delay_seconds(3), 40);
        assert_eq!(backoff_delay_seconds(4), 80);
        assert_eq!(backoff_delay_seconds(5), 160);
        assert_eq!(backoff_delay_seconds(6), 320);
        assert_eq!(backoff_delay_seconds(7), 320);
        assert_eq!(backoff_delay_seconds(100), 320);
    }

    #[test]
    fn transition_table_is_exhaustive() {
        use MessageStatus::*;
        let all = [Received, Dispatched, Acknowledged, Processed, Failed];
        let allowed = [
            (Received, Dispatched),
            (Received, Failed),
            (Dispatched, Acknowledged),
            (Dispatched, Processed),
            (Dispatched, Failed),
            (Acknowledged, Processed),
            (Acknowledged, Failed),
        ];
        for from in all {
            for to in all {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{from} -> {to} expected {expected}"
                );
            }
        }
    }

    #[test]
    fn failed_and_processed_are_terminal_in_place() {
        use MessageStatus::*;
        for target in [Received, Dispatched, Acknowledged, Processed, Failed] {
            assert!(!Processed.can_transition_to(target));
            assert!(!Failed.can_transition_to(target));
        }
    }

    #[test]
    fn enum_round_trips() {
        for integration in [
            Integration::Storefront,
            Integration::ErpPos,
            Integration::Accounting,
        ] {
            assert_eq!(Integration::parse(integration.as_str()), Some(integration));
        }
        for status in [
            MessageStatus::Received,
            MessageStatus::Dispatched,
            MessageStatus::Acknowledged,
            MessageStatus::Processed,
            MessageStatus::Failed,
        ] {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(Integration::parse("unknown"), None);
    }

    #[test]
    fn payload_size_counts_serialized_bytes() {
        assert_eq!(payload_byte_size(&Value::Null), 0);
        assert_eq!(payload_byte_size(&json!({})), 2);
        // `{"k":"aa...a"}` → 8 bytes of scaffolding + the string body.
        let body = "a".repeat(MAX_PAYLOAD_BYTES - 8);
        let at_limit = json!({ "k": body });
        assert_eq!(payload_byte_size(&at_limit), MAX_PAYLOAD_BYTES);
        let over = json!({ "k": format!("{}b", "a".repeat(MAX_PAYLOAD_BYTES - 8)) });
        assert_eq!(payload_byte_size(&over), MAX_PAYLOAD_BYTES + 1);
    }
}
