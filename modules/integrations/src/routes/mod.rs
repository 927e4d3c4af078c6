//! HTTP surface: webhook ingress and the operator endpoints.

pub mod accounting;
pub mod admin;
pub mod erp_pos;
pub mod storefront;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::IntegrationError;
use crate::health::health;
use crate::models::{Direction, Integration, IntegrationMessage, NewMessage};
use crate::repos::message_repo;
use crate::AppState;

/// The full HTTP surface: health, webhook ingress, operator endpoints.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/webhooks/storefront/{organization_id}",
            post(storefront::storefront_webhook),
        )
        .route(
            "/webhooks/accounting/{organization_id}",
            post(accounting::accounting_webhook),
        )
        .route("/webhooks/erp/{organization_id}", post(erp_pos::erp_webhook))
        .route(
            "/api/organizations/{organization_id}/messages",
            get(admin::list_messages),
        )
        .route(
            "/api/organizations/{organization_id}/messages/{message_id}",
            get(admin::get_message),
        )
        .route(
            "/api/organizations/{organization_id}/fulfillment-orders/{order_id}",
            get(admin::get_fulfillment_order),
        )
        .route(
            "/api/organizations/{organization_id}/fulfillment-orders/{order_id}/return",
            post(admin::create_return),
        )
        .with_state(state)
}

/// Error body shared by every route.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub detail: String,
}

pub type RouteError = (StatusCode, Json<ErrorResponse>);

pub fn route_error(status: StatusCode, detail: impl Into<String>) -> RouteError {
    (
        status,
        Json(ErrorResponse {
            detail: detail.into(),
        }),
    )
}

pub fn internal_error(e: impl std::fmt::Display) -> RouteError {
    tracing::error!(error = %e, "request failed");
    route_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

/// Accepted-webhook body: `202 {"status": "accepted", "message_id": ...}`.
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub status: &'static str,
    pub message_id: Uuid,
}

/// Length-safe constant-time byte comparison for shared-secret headers.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = (a.len() ^ b.len()) as u8;
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

/// Record an inbound message and hand it to the processor.
///
/// A duplicate idempotency key collapses onto the original row: the caller
/// still gets a 202 with the existing message id and nothing is re-enqueued.
pub async fn record_and_dispatch(
    state: &AppState,
    organization_id: Uuid,
    integration: Integration,
    event_type: String,
    external_reference: String,
    idempotency_key: String,
    payload: Value,
) -> Result<(StatusCode, Json<AcceptedResponse>), RouteError> {
    let new = NewMessage::inbound(organization_id, integration, event_type, payload)
        .with_external_reference(external_reference)
        .with_idempotency_key(idempotency_key.clone());

    let message = match message_repo::create(&state.pool, new).await {
        Ok(message) => message,
        Err(IntegrationError::DuplicateIdempotencyKey { .. }) => {
            let existing = message_repo::find_by_idempotency_key(
                &state.pool,
                organization_id,
                integration,
                Direction::Inbound,
                &idempotency_key,
            )
            .await
            .map_err(internal_error)?;
            let Some(existing) = existing else {
                return Err(internal_error("duplicate row disappeared during lookup"));
            };
            tracing::info!(
                message_id = %existing.id,
                idempotency_key = %idempotency_key,
                "duplicate webhook collapsed onto existing message"
            );
            return Ok((
                StatusCode::ACCEPTED,
                Json(AcceptedResponse {
                    status: "accepted",
                    message_id: existing.id,
                }),
            ));
        }
        Err(IntegrationError::PayloadTooLarge { bytes, max }) => {
            return Err(route_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("payload of {bytes} bytes exceeds the {max} byte limit"),
            ));
        }
        Err(e) => return Err(internal_error(e)),
    };

    dispatch_message(state, &message).await
}

async fn dispatch_message(
    state: &AppState,
    message: &IntegrationMessage,
) -> Result<(StatusCode, Json<AcceptedResponse>), RouteError> {
    message_repo::mark_dispatched(
        &state.pool,
        message.id,
        None,
        Some(StatusCode::ACCEPTED.as_u16() as i32),
        None,
    )
    .await
    .map_err(internal_error)?;
    state.queue.enqueue(message.id);

    tracing::info!(
        message_id = %message.id,
        integration = %message.integration,
        event_type = %message.event_type,
        "webhook accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            message_id: message.id,
        }),
    ))
}
