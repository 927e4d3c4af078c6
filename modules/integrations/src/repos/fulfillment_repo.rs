//! Persistence for the fulfillment order aggregate.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::{IntegrationError, IntegrationResult};
use crate::models::{FulfillmentOrder, FulfillmentStatus, Integration};

const ORDER_COLUMNS: &str = r#"
    id, organization_id, source, order_id, seller_company, distributor_company,
    status, payload, normalized_order, fulfillment_payload, result_payload,
    serial_numbers, sales_order_name, delivery_note_name, delivery_note_submitted_at,
    return_delivery_note_name, return_delivery_note_submitted_at, return_payload,
    backorder_attempts, last_error_code, last_error_message, next_attempt_at,
    source_message_id, created_at, updated_at
"#;

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    organization_id: Uuid,
    source: String,
    order_id: String,
    seller_company: String,
    distributor_company: String,
    status: String,
    payload: Value,
    normalized_order: Value,
    fulfillment_payload: Value,
    result_payload: Value,
    serial_numbers: Value,
    sales_order_name: String,
    delivery_note_name: String,
    delivery_note_submitted_at: Option<DateTime<Utc>>,
    return_delivery_note_name: String,
    return_delivery_note_submitted_at: Option<DateTime<Utc>>,
    return_payload: Value,
    backorder_attempts: i32,
    last_error_code: String,
    last_error_message: String,
    next_attempt_at: Option<DateTime<Utc>>,
    source_message_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OrderRow {
    fn into_order(self) -> IntegrationResult<FulfillmentOrder> {
        let source = Integration::parse(&self.source).ok_or_else(|| {
            IntegrationError::Unexpected(format!("unknown fulfillment source '{}'", self.source))
        })?;
        let status = FulfillmentStatus::parse(&self.status).ok_or_else(|| {
            IntegrationError::Unexpected(format!("unknown fulfillment status '{}'", self.status))
        })?;
        Ok(FulfillmentOrder {
            id: self.id,
            organization_id: self.organization_id,
            source,
            order_id: self.order_id,
            seller_company: self.seller_company,
            distributor_company: self.distributor_company,
            status,
            payload: self.payload,
            normalized_order: self.normalized_order,
            fulfillment_payload: self.fulfillment_payload,
            result_payload: self.result_payload,
            serial_numbers: self.serial_numbers,
            sales_order_name: self.sales_order_name,
            delivery_note_name: self.delivery_note_name,
            delivery_note_submitted_at: self.delivery_note_submitted_at,
            return_delivery_note_name: self.return_delivery_note_name,
            return_delivery_note_submitted_at: self.return_delivery_note_submitted_at,
            return_payload: self.return_payload,
            backorder_attempts: self.backorder_attempts,
            last_error_code: self.last_error_code,
            last_error_message: self.last_error_message,
            next_attempt_at: self.next_attempt_at,
            source_message_id: self.source_message_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub async fn get(pool: &PgPool, id: Uuid) -> IntegrationResult<Option<FulfillmentOrder>> {
    let sql = format!("SELECT {ORDER_COLUMNS} FROM fulfillment_orders WHERE id = $1");
    let row = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(OrderRow::into_order).transpose()
}

pub async fn get_for_organization(
    pool: &PgPool,
    organization_id: Uuid,
    id: Uuid,
) -> IntegrationResult<Option<FulfillmentOrder>> {
    let sql = format!(
        "SELECT {ORDER_COLUMNS} FROM fulfillment_orders WHERE id = $1 AND organization_id = $2"
    );
    let row = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(id)
        .bind(organization_id)
        .fetch_optional(pool)
        .await?;
    row.map(OrderRow::into_order).transpose()
}

/// Look up the aggregate by its natural key.
pub async fn find(
    pool: &PgPool,
    organization_id: Uuid,
    source: Integration,
    order_id: &str,
) -> IntegrationResult<Option<FulfillmentOrder>> {
    let sql = format!(
        r#"
        SELECT {ORDER_COLUMNS} FROM fulfillment_orders
        WHERE organization_id = $1 AND source = $2 AND order_id = $3
        "#
    );
    let row = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(organization_id)
        .bind(source.as_str())
        .bind(order_id)
        .fetch_optional(pool)
        .await?;
    row.map(OrderRow::into_order).transpose()
}

/// Load or create the aggregate for `(organization, source, order_id)`.
///
/// An existing row keeps its lifecycle state but refreshes the raw payload,
/// company routing, and the message that last drove it.
pub async fn get_or_create(
    pool: &PgPool,
    organization_id: Uuid,
    source: Integration,
    order_id: &str,
    seller_company: &str,
    distributor_company: &str,
    payload: &Value,
    source_message_id: Uuid,
) -> IntegrationResult<FulfillmentOrder> {
    let sql = format!(
        r#"
        INSERT INTO fulfillment_orders
            (id, organization_id, source, order_id, seller_company,
             distributor_company, status, payload, source_message_id)
        VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8)
        ON CONFLICT (organization_id, source, order_id) DO UPDATE
        SET payload = EXCLUDED.payload,
            seller_company = CASE WHEN EXCLUDED.seller_company <> ''
                                  THEN EXCLUDED.seller_company
                                  ELSE fulfillment_orders.seller_company END,
            distributor_company = CASE WHEN EXCLUDED.distributor_company <> ''
                                       THEN EXCLUDED.distributor_company
                                       ELSE fulfillment_orders.distributor_company END,
            source_message_id = EXCLUDED.source_message_id,
            updated_at = NOW()
        RETURNING {ORDER_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(Uuid::new_v4())
        .bind(organization_id)
        .bind(source.as_str())
        .bind(order_id)
        .bind(seller_company)
        .bind(distributor_company)
        .bind(payload)
        .bind(source_message_id)
        .fetch_one(pool)
        .await?;
    row.into_order()
}

pub async fn mark_status(
    pool: &PgPool,
    id: Uuid,
    status: FulfillmentStatus,
    error_code: &str,
    error_message: &str,
    next_attempt_at: Option<DateTime<Utc>>,
) -> IntegrationResult<()> {
    sqlx::query(
        r#"
        UPDATE fulfillment_orders
        SET status = $2, last_error_code = $3, last_error_message = $4,
            next_attempt_at = $5, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status.as_str())
    .bind(error_code)
    .bind(error_message)
    .bind(next_attempt_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Park the order waiting for stock and schedule the next backorder attempt.
pub async fn mark_waiting_stock(
    pool: &PgPool,
    id: Uuid,
    error_message: &str,
    delay_seconds: i64,
) -> IntegrationResult<()> {
    let next_attempt_at = Utc::now() + Duration::seconds(delay_seconds);
    sqlx::query(
        r#"
        UPDATE fulfillment_orders
        SET status = 'waiting_stock', backorder_attempts = backorder_attempts + 1,
            last_error_code = 'waiting_stock', last_error_message = $2,
            next_attempt_at = $3, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(error_message)
    .bind(next_attempt_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn save_normalized_order(
    pool: &PgPool,
    id: Uuid,
    normalized_order: &Value,
) -> IntegrationResult<()> {
    sqlx::query(
        "UPDATE fulfillment_orders SET normalized_order = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .bind(normalized_order)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn save_mapping_snapshot(
    pool: &PgPool,
    id: Uuid,
    snapshot: &Value,
) -> IntegrationResult<()> {
    sqlx::query(
        "UPDATE fulfillment_orders SET fulfillment_payload = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .bind(snapshot)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a completed fulfillment: documents, serials, result payload,
/// `fulfilled` status, cleared diagnostics.
pub async fn record_fulfillment(
    pool: &PgPool,
    id: Uuid,
    delivery_note: &str,
    sales_order: Option<&str>,
    serials: &[String],
    result_payload: &Value,
) -> IntegrationResult<()> {
    sqlx::query(
        r#"
        UPDATE fulfillment_orders
        SET delivery_note_name = $2, sales_order_name = $3, serial_numbers = $4,
            result_payload = $5, delivery_note_submitted_at = NOW(),
            status = 'fulfilled', last_error_code = '', last_error_message = '',
            next_attempt_at = NULL, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(delivery_note)
    .bind(sales_order.unwrap_or(""))
    .bind(serde_json::to_value(serials).unwrap_or(Value::Null))
    .bind(result_payload)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a completed return against the original delivery note.
pub async fn record_return(
    pool: &PgPool,
    id: Uuid,
    return_delivery_note: &str,
    return_payload: &Value,
) -> IntegrationResult<()> {
    sqlx::query(
        r#"
        UPDATE fulfillment_orders
        SET return_delivery_note_name = $2, return_delivery_note_submitted_at = NOW(),
            return_payload = $3, status = 'returned', last_error_code = '',
            last_error_message = '', next_attempt_at = NULL, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(return_delivery_note)
    .bind(return_payload)
    .execute(pool)
    .await?;
    Ok(())
}

/// Merge a key into `result_payload` without touching the lifecycle state.
pub async fn merge_result_payload(
    pool: &PgPool,
    id: Uuid,
    key: &str,
    value: &Value,
) -> IntegrationResult<()> {
    sqlx::query(
        r#"
        UPDATE fulfillment_orders
        SET result_payload = jsonb_set(result_payload, ARRAY[$2], $3, true),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// Push a backordered order's schedule forward without touching its state.
pub async fn defer_backorder(pool: &PgPool, id: Uuid, delay_seconds: i64) -> IntegrationResult<()> {
    let next_attempt_at = Utc::now() + Duration::seconds(delay_seconds);
    sqlx::query(
        r#"
        UPDATE fulfillment_orders
        SET next_attempt_at = $2, updated_at = NOW()
        WHERE id = $1 AND status = 'waiting_stock'
        "#,
    )
    .bind(id)
    .bind(next_attempt_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Backordered orders whose retry window has elapsed.
pub async fn needing_retry(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> IntegrationResult<Vec<FulfillmentOrder>> {
    let sql = format!(
        r#"
        SELECT {ORDER_COLUMNS} FROM fulfillment_orders
        WHERE status = 'waiting_stock'
          AND (next_attempt_at IS NULL OR next_attempt_at <= $1)
        ORDER BY updated_at ASC
        LIMIT $2
        "#
    );
    let rows = sqlx::query_as::<_, OrderRow>(&sql)
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(OrderRow::into_order).collect()
}
