//! Message store: persistence and the state machine for integration messages.
//!
//! All state changes go through [`transition`], which re-reads the row under a
//! row-level lock, checks the allowed-transitions table, applies the caller's
//! delta, and commits. Callers supply only the delta; the store owns the lock
//! discipline. Nothing awaits a network call while the lock is held.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::{IntegrationError, IntegrationResult};
use crate::models::{
    backoff_delay_seconds, payload_byte_size, Direction, Integration, IntegrationMessage,
    MessageStatus, NewMessage, MAX_PAYLOAD_BYTES,
};

const MESSAGE_COLUMNS: &str = r#"
    id, organization_id, integration, direction, status, event_type,
    external_reference, payload, response_payload, error_code, error_message,
    retries, received_at, dispatched_at, acknowledged_at, processed_at,
    last_attempt_at, next_attempt_at, http_status, latency_ms, idempotency_key
"#;

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    organization_id: Uuid,
    integration: String,
    direction: String,
    status: String,
    event_type: String,
    external_reference: String,
    payload: Value,
    response_payload: Value,
    error_code: String,
    error_message: String,
    retries: i32,
    received_at: DateTime<Utc>,
    dispatched_at: Option<DateTime<Utc>>,
    acknowledged_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
    last_attempt_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    http_status: Option<i32>,
    latency_ms: Option<i32>,
    idempotency_key: String,
}

impl MessageRow {
    fn into_message(self) -> IntegrationResult<IntegrationMessage> {
        let integration = Integration::parse(&self.integration).ok_or_else(|| {
            IntegrationError::Unexpected(format!("unknown integration '{}'", self.integration))
        })?;
        let direction = Direction::parse(&self.direction).ok_or_else(|| {
            IntegrationError::Unexpected(format!("unknown direction '{}'", self.direction))
        })?;
        let status = MessageStatus::parse(&self.status).ok_or_else(|| {
            IntegrationError::Unexpected(format!("unknown status '{}'", self.status))
        })?;
        Ok(IntegrationMessage {
            id: self.id,
            organization_id: self.organization_id,
            integration,
            direction,
            status,
            event_type: self.event_type,
            external_reference: self.external_reference,
            payload: self.payload,
            response_payload: self.response_payload,
            error_code: self.error_code,
            error_message: self.error_message,
            retries: self.retries,
            received_at: self.received_at,
            dispatched_at: self.dispatched_at,
            acknowledged_at: self.acknowledged_at,
            processed_at: self.processed_at,
            last_attempt_at: self.last_attempt_at,
            next_attempt_at: self.next_attempt_at,
            http_status: self.http_status,
            latency_ms: self.latency_ms,
            idempotency_key: self.idempotency_key,
        })
    }
}

fn check_payload_size(value: &Value) -> IntegrationResult<()> {
    let bytes = payload_byte_size(value);
    if bytes > MAX_PAYLOAD_BYTES {
        return Err(IntegrationError::PayloadTooLarge {
            bytes,
            max: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(())
}

/// The partial unique index enforcing inbound idempotency; see the first
/// migration for its exact predicate.
const INBOUND_IDEMPOTENCY_CONSTRAINT: &str = "uniq_integration_inbound_idempotency";

/// Create a new message row in `received` status.
///
/// Inbound rows with a non-empty idempotency key are guarded by a partial
/// unique index over `(organization, integration, direction, key)`, so a
/// duplicate delivery loses the insert race inside Postgres and surfaces as
/// [`IntegrationError::DuplicateIdempotencyKey`]. The index excludes `failed`
/// rows, which is what lets [`schedule_retry`] create a successor carrying
/// its predecessor's key, and it excludes outbound rows, whose derived keys
/// exist purely for correlation (one logical upstream document yields several
/// calls sharing a reference).
pub async fn create(pool: &PgPool, new: NewMessage) -> IntegrationResult<IntegrationMessage> {
    check_payload_size(&new.payload)?;

    let id = Uuid::new_v4();
    let sql = format!(
        r#"
        INSERT INTO integration_messages
            (id, organization_id, integration, direction, status, event_type,
             external_reference, idempotency_key, payload, retries, next_attempt_at)
        VALUES ($1, $2, $3, $4, 'received', $5, $6, $7, $8, $9, $10)
        RETURNING {MESSAGE_COLUMNS}
        "#
    );

    let result = sqlx::query_as::<_, MessageRow>(&sql)
        .bind(id)
        .bind(new.organization_id)
        .bind(new.integration.as_str())
        .bind(new.direction.as_str())
        .bind(&new.event_type)
        .bind(&new.external_reference)
        .bind(&new.idempotency_key)
        .bind(&new.payload)
        .bind(new.retries)
        .bind(new.next_attempt_at)
        .fetch_one(pool)
        .await;

    match result {
        Ok(row) => row.into_message(),
        Err(e) => {
            if let Some(db_err) = e.as_database_error() {
                if db_err.is_unique_violation()
                    && db_err.constraint() == Some(INBOUND_IDEMPOTENCY_CONSTRAINT)
                {
                    return Err(IntegrationError::DuplicateIdempotencyKey {
                        idempotency_key: new.idempotency_key,
                    });
                }
            }
            Err(e.into())
        }
    }
}

pub async fn get(pool: &PgPool, id: Uuid) -> IntegrationResult<Option<IntegrationMessage>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM integration_messages WHERE id = $1");
    let row = sqlx::query_as::<_, MessageRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(MessageRow::into_message).transpose()
}

/// Look up the earliest row holding a given idempotency key. Used by the
/// ingress to collapse duplicate webhooks onto the original message id.
pub async fn find_by_idempotency_key(
    pool: &PgPool,
    organization_id: Uuid,
    integration: Integration,
    direction: Direction,
    idempotency_key: &str,
) -> IntegrationResult<Option<IntegrationMessage>> {
    if idempotency_key.is_empty() {
        return Ok(None);
    }
    let sql = format!(
        r#"
        SELECT {MESSAGE_COLUMNS} FROM integration_messages
        WHERE organization_id = $1 AND integration = $2 AND direction = $3
          AND idempotency_key = $4
        ORDER BY received_at ASC
        LIMIT 1
        "#
    );
    let row = sqlx::query_as::<_, MessageRow>(&sql)
        .bind(organization_id)
        .bind(integration.as_str())
        .bind(direction.as_str())
        .bind(idempotency_key)
        .fetch_optional(pool)
        .await?;
    row.map(MessageRow::into_message).transpose()
}

/// Field delta applied by [`transition`]. `None` keeps the stored value;
/// `next_attempt_at` uses a nested option so `Some(None)` clears the column.
#[derive(Debug, Default, Clone)]
pub struct MessageUpdate {
    pub dispatched_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,
    pub retries: Option<i32>,
    pub http_status: Option<i32>,
    pub latency_ms: Option<i32>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub response_payload: Option<Value>,
}

/// Transition a message to `target`, applying the field delta atomically.
///
/// The row is re-read under `FOR UPDATE`; a target outside the allowed set for
/// the *current* status fails with `InvalidTransition` and leaves the row
/// untouched. A `target` equal to the current status is a same-state update
/// and bypasses the table (used for response-payload annotations).
pub async fn transition(
    pool: &PgPool,
    id: Uuid,
    target: MessageStatus,
    update: MessageUpdate,
) -> IntegrationResult<IntegrationMessage> {
    if let Some(response) = &update.response_payload {
        check_payload_size(response)?;
    }

    let mut tx = pool.begin().await?;

    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM integration_messages WHERE id = $1 FOR UPDATE");
    let row = sqlx::query_as::<_, MessageRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| IntegrationError::Unexpected(format!("message {id} not found")))?;
    let mut current = row.into_message()?;

    if target != current.status && !current.status.can_transition_to(target) {
        return Err(IntegrationError::InvalidTransition {
            message_id: id,
            from: current.status.as_str().to_string(),
            to: target.as_str().to_string(),
        });
    }

    current.status = target;
    if let Some(v) = update.dispatched_at {
        current.dispatched_at = Some(v);
    }
    if let Some(v) = update.acknowledged_at {
        current.acknowledged_at = Some(v);
    }
    if let Some(v) = update.processed_at {
        current.processed_at = Some(v);
    }
    if let Some(v) = update.last_attempt_at {
        current.last_attempt_at = Some(v);
    }
    if let Some(v) = update.next_attempt_at {
        current.next_attempt_at = v;
    }
    if let Some(v) = update.retries {
        current.retries = v;
    }
    if let Some(v) = update.http_status {
        current.http_status = Some(v);
    }
    if let Some(v) = update.latency_ms {
        current.latency_ms = Some(v);
    }
    if let Some(v) = update.error_code {
        current.error_code = v;
    }
    if let Some(v) = update.error_message {
        current.error_message = v;
    }
    if let Some(v) = update.response_payload {
        current.response_payload = v;
    }

    sqlx::query(
        r#"
        UPDATE integration_messages
        SET status = $2, dispatched_at = $3, acknowledged_at = $4, processed_at = $5,
            last_attempt_at = $6, next_attempt_at = $7, retries = $8, http_status = $9,
            latency_ms = $10, error_code = $11, error_message = $12, response_payload = $13
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(current.status.as_str())
    .bind(current.dispatched_at)
    .bind(current.acknowledged_at)
    .bind(current.processed_at)
    .bind(current.last_attempt_at)
    .bind(current.next_attempt_at)
    .bind(current.retries)
    .bind(current.http_status)
    .bind(current.latency_ms)
    .bind(&current.error_code)
    .bind(&current.error_message)
    .bind(&current.response_payload)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(current)
}

/// Record a delivery attempt. No-op when the message already moved past the
/// dispatchable states.
pub async fn mark_dispatched(
    pool: &PgPool,
    id: Uuid,
    attempted_at: Option<DateTime<Utc>>,
    http_status: Option<i32>,
    latency_ms: Option<i32>,
) -> IntegrationResult<IntegrationMessage> {
    let current = get(pool, id)
        .await?
        .ok_or_else(|| IntegrationError::Unexpected(format!("message {id} not found")))?;
    if !matches!(
        current.status,
        MessageStatus::Received | MessageStatus::Dispatched
    ) {
        return Ok(current);
    }

    let attempted_at = attempted_at.unwrap_or_else(Utc::now);
    transition(
        pool,
        id,
        MessageStatus::Dispatched,
        MessageUpdate {
            dispatched_at: Some(attempted_at),
            last_attempt_at: Some(attempted_at),
            next_attempt_at: Some(None),
            http_status,
            latency_ms,
            ..Default::default()
        },
    )
    .await
}

pub async fn mark_acknowledged(pool: &PgPool, id: Uuid) -> IntegrationResult<IntegrationMessage> {
    transition(
        pool,
        id,
        MessageStatus::Acknowledged,
        MessageUpdate {
            acknowledged_at: Some(Utc::now()),
            ..Default::default()
        },
    )
    .await
}

pub async fn mark_processed(
    pool: &PgPool,
    id: Uuid,
    response: Option<Value>,
    http_status: Option<i32>,
    latency_ms: Option<i32>,
) -> IntegrationResult<IntegrationMessage> {
    transition(
        pool,
        id,
        MessageStatus::Processed,
        MessageUpdate {
            processed_at: Some(Utc::now()),
            next_attempt_at: Some(None),
            response_payload: response,
            http_status,
            latency_ms,
            ..Default::default()
        },
    )
    .await
}

/// Mark a message failed, bumping `retries` and scheduling `next_attempt_at`
/// from the pre-increment count when the failure is retryable.
pub async fn mark_failed(
    pool: &PgPool,
    id: Uuid,
    error_code: &str,
    error_message: &str,
    http_status: Option<i32>,
    retryable: bool,
) -> IntegrationResult<IntegrationMessage> {
    let current = get(pool, id)
        .await?
        .ok_or_else(|| IntegrationError::Unexpected(format!("message {id} not found")))?;

    let now = Utc::now();
    let next_attempt_at = if retryable {
        let delay = backoff_delay_seconds(current.retries);
        Some(now + Duration::seconds(delay))
    } else {
        None
    };

    transition(
        pool,
        id,
        MessageStatus::Failed,
        MessageUpdate {
            error_code: Some(error_code.to_string()),
            error_message: Some(error_message.to_string()),
            processed_at: Some(now),
            last_attempt_at: Some(now),
            retries: Some(current.retries + 1),
            next_attempt_at: Some(next_attempt_at),
            http_status,
            ..Default::default()
        },
    )
    .await
}

/// Same-state annotation of `response_payload`; used by the processor to
/// attach the failure summary and successor pointer to a terminal row.
pub async fn set_response_payload(
    pool: &PgPool,
    id: Uuid,
    response: Value,
) -> IntegrationResult<()> {
    check_payload_size(&response)?;
    sqlx::query("UPDATE integration_messages SET response_payload = $2 WHERE id = $1")
        .bind(id)
        .bind(&response)
        .execute(pool)
        .await?;
    Ok(())
}

/// Create the successor row for a failed message: same identity and payload,
/// fresh `received` status, error fields cleared, attempt counter carried
/// over, scheduled `delay` seconds out.
pub async fn schedule_retry(
    pool: &PgPool,
    message: &IntegrationMessage,
    delay_override_seconds: Option<i64>,
) -> IntegrationResult<IntegrationMessage> {
    let delay = delay_override_seconds.unwrap_or_else(|| backoff_delay_seconds(message.retries));
    let next_attempt_at = Utc::now() + Duration::seconds(delay);

    let id = Uuid::new_v4();
    let sql = format!(
        r#"
        INSERT INTO integration_messages
            (id, organization_id, integration, direction, status, event_type,
             external_reference, idempotency_key, payload, retries, next_attempt_at)
        VALUES ($1, $2, $3, $4, 'received', $5, $6, $7, $8, $9, $10)
        RETURNING {MESSAGE_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, MessageRow>(&sql)
        .bind(id)
        .bind(message.organization_id)
        .bind(message.integration.as_str())
        .bind(message.direction.as_str())
        .bind(&message.event_type)
        .bind(&message.external_reference)
        .bind(&message.idempotency_key)
        .bind(&message.payload)
        .bind(message.retries)
        .bind(next_attempt_at)
        .fetch_one(pool)
        .await?;
    row.into_message()
}

/// Messages ready for a worker: `received` with no schedule or a due one.
pub async fn pending(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> IntegrationResult<Vec<IntegrationMessage>> {
    let sql = format!(
        r#"
        SELECT {MESSAGE_COLUMNS} FROM integration_messages
        WHERE status = 'received'
          AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
        ORDER BY received_at ASC
        LIMIT $2
        "#
    );
    let rows = sqlx::query_as::<_, MessageRow>(&sql)
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(MessageRow::into_message).collect()
}

/// Operator listing, newest first, scoped to a tenant.
pub async fn list_for_organization(
    pool: &PgPool,
    organization_id: Uuid,
    integration: Option<Integration>,
    status: Option<MessageStatus>,
    external_reference: Option<&str>,
    limit: i64,
) -> IntegrationResult<Vec<IntegrationMessage>> {
    let sql = format!(
        r#"
        SELECT {MESSAGE_COLUMNS} FROM integration_messages
        WHERE organization_id = $1
          AND ($2::text IS NULL OR integration = $2)
          AND ($3::text IS NULL OR status = $3)
          AND ($4::text IS NULL OR external_reference = $4)
        ORDER BY received_at DESC
        LIMIT $5
        "#
    );
    let rows = sqlx::query_as::<_, MessageRow>(&sql)
        .bind(organization_id)
        .bind(integration.map(|i| i.as_str()))
        .bind(status.map(|s| s.as_str()))
        .bind(external_reference)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(MessageRow::into_message).collect()
}
