//! Accounting webhook ingress: shared-secret validated events.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::Value;
use uuid::Uuid;

use crate::models::Integration;
use crate::repos::credential_repo;
use crate::routes::{
    constant_time_eq, internal_error, record_and_dispatch, route_error, AcceptedResponse,
    RouteError,
};
use crate::AppState;

/// POST `/webhooks/accounting/{organization_id}`
///
/// The `X-Accounting-Webhook-Secret` header is compared in constant time
/// against the tenant's configured secret.
pub async fn accounting_webhook(
    State(state): State<Arc<AppState>>,
    Path(organization_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<AcceptedResponse>), RouteError> {
    let credential =
        credential_repo::accounting_with_webhook_secret(&state.pool, organization_id)
            .await
            .map_err(internal_error)?
            .ok_or_else(|| {
                route_error(
                    StatusCode::FORBIDDEN,
                    "no webhook secret configured for the organization",
                )
            })?;

    let provided = headers
        .get("X-Accounting-Webhook-Secret")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if provided.is_empty() {
        return Err(route_error(
            StatusCode::FORBIDDEN,
            "missing webhook validation header",
        ));
    }
    if !constant_time_eq(provided.as_bytes(), credential.webhook_secret.as_bytes()) {
        tracing::warn!(organization_id = %organization_id, "accounting webhook secret rejected");
        return Err(route_error(StatusCode::FORBIDDEN, "invalid webhook secret"));
    }

    let event_type = payload
        .get("event")
        .or_else(|| payload.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let external_reference = match payload.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => payload
            .get("data")
            .and_then(|data| data.get("id"))
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default(),
    };

    let idempotency_key = payload
        .get("idempotency_key")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| scoped_key(&event_type, &external_reference));

    record_and_dispatch(
        &state,
        organization_id,
        Integration::Accounting,
        event_type,
        external_reference,
        idempotency_key,
        payload,
    )
    .await
}

/// Without an upstream-supplied key, scope the reference by event type so
/// distinct events about the same document do not collide.
pub(crate) fn scoped_key(event_type: &str, external_reference: &str) -> String {
    if external_reference.is_empty() {
        return String::new();
    }
    if event_type.is_empty() {
        return external_reference.to_string();
    }
    format!("{event_type}:{external_reference}")
}
