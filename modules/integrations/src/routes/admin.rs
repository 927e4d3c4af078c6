//! Operator endpoints: message search, fulfillment order inspection, returns.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::IntegrationError;
use crate::models::{Integration, MessageStatus};
use crate::repos::{fulfillment_repo, message_repo};
use crate::routes::{internal_error, route_error, RouteError};
use crate::services::fulfillment_returns;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageListQuery {
    pub integration: Option<String>,
    pub status: Option<String>,
    pub reference: Option<String>,
    pub limit: Option<i64>,
}

/// GET `/api/organizations/{organization_id}/messages`
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(organization_id): Path<Uuid>,
    Query(query): Query<MessageListQuery>,
) -> Result<Json<Value>, RouteError> {
    let integration = match query.integration.as_deref() {
        Some(raw) => Some(Integration::parse(raw).ok_or_else(|| {
            route_error(
                StatusCode::BAD_REQUEST,
                format!("unknown integration '{raw}'"),
            )
        })?),
        None => None,
    };
    let status = match query.status.as_deref() {
        Some(raw) => Some(MessageStatus::parse(raw).ok_or_else(|| {
            route_error(StatusCode::BAD_REQUEST, format!("unknown status '{raw}'"))
        })?),
        None => None,
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 500);

    let messages = message_repo::list_for_organization(
        &state.pool,
        organization_id,
        integration,
        status,
        query.reference.as_deref(),
        limit,
    )
    .await
    .map_err(internal_error)?;

    Ok(Json(serde_json::json!({ "messages": messages })))
}

/// GET `/api/organizations/{organization_id}/messages/{message_id}`
pub async fn get_message(
    State(state): State<Arc<AppState>>,
    Path((organization_id, message_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Value>, RouteError> {
    let message = message_repo::get(&state.pool, message_id)
        .await
        .map_err(internal_error)?
        .filter(|message| message.organization_id == organization_id)
        .ok_or_else(|| route_error(StatusCode::NOT_FOUND, "message not found"))?;
    Ok(Json(serde_json::json!({ "message": message })))
}

/// GET `/api/organizations/{organization_id}/fulfillment-orders/{order_id}`
pub async fn get_fulfillment_order(
    State(state): State<Arc<AppState>>,
    Path((organization_id, order_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Value>, RouteError> {
    let order = fulfillment_repo::get_for_organization(&state.pool, organization_id, order_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| route_error(StatusCode::NOT_FOUND, "fulfillment order not found"))?;
    Ok(Json(serde_json::json!({ "fulfillment_order": order })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReturnRequest {
    #[serde(default)]
    pub reason: String,
    pub warehouse: Option<String>,
}

/// POST `/api/organizations/{organization_id}/fulfillment-orders/{order_id}/return`
pub async fn create_return(
    State(state): State<Arc<AppState>>,
    Path((organization_id, order_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<ReturnRequest>,
) -> Result<Json<Value>, RouteError> {
    let result = fulfillment_returns::process_return(
        &state.pool,
        organization_id,
        order_id,
        &request.reason,
        request.warehouse.as_deref(),
    )
    .await
    .map_err(|e| match &e {
        IntegrationError::Fulfillment { error_code, .. } => match error_code.as_str() {
            "missing_delivery_note" | "missing_serials" => {
                route_error(StatusCode::CONFLICT, e.to_string())
            }
            "configuration_error" => route_error(StatusCode::BAD_REQUEST, e.to_string()),
            _ => route_error(StatusCode::BAD_GATEWAY, e.to_string()),
        },
        IntegrationError::Api { .. } => route_error(StatusCode::BAD_GATEWAY, e.to_string()),
        _ => internal_error(e),
    })?;
    Ok(Json(result))
}
