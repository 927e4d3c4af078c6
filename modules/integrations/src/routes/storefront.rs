//! Storefront webhook ingress: HMAC-validated order events.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use crate::models::Integration;
use crate::repos::credential_repo;
use crate::routes::{internal_error, record_and_dispatch, route_error, AcceptedResponse, RouteError};
use crate::AppState;

type HmacSha256 = Hmac<Sha256>;

/// POST `/webhooks/storefront/{organization_id}`
///
/// Headers: `X-Shop-Domain`, `X-HMAC-SHA256` (base64 digest of the raw body),
/// `X-Topic`, `X-Webhook-Id`. Signature failures are rejected without
/// recording anything.
pub async fn storefront_webhook(
    State(state): State<Arc<AppState>>,
    Path(organization_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>), RouteError> {
    let shop_domain = header(&headers, "X-Shop-Domain")
        .ok_or_else(|| route_error(StatusCode::BAD_REQUEST, "missing X-Shop-Domain header"))?;

    let store = credential_repo::storefront_store(&state.pool, organization_id, &shop_domain)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| {
            route_error(
                StatusCode::NOT_FOUND,
                format!("no storefront registered for domain {shop_domain}"),
            )
        })?;

    let signature = header(&headers, "X-HMAC-SHA256")
        .ok_or_else(|| route_error(StatusCode::UNAUTHORIZED, "missing webhook signature"))?;
    if !verify_signature(&store.webhook_shared_secret, &body, &signature) {
        tracing::warn!(shop_domain = %shop_domain, "storefront webhook signature rejected");
        return Err(route_error(
            StatusCode::UNAUTHORIZED,
            "webhook signature validation failed",
        ));
    }

    let mut payload: Value = serde_json::from_slice(&body)
        .map_err(|_| route_error(StatusCode::BAD_REQUEST, "body is not valid JSON"))?;

    let topic = header(&headers, "X-Topic").unwrap_or_default();
    let event_type = topic.replace('/', ".");
    let webhook_id = header(&headers, "X-Webhook-Id").unwrap_or_default();

    let external_reference = ["id", "name", "order_number"]
        .iter()
        .find_map(|key| match payload.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_default();

    if let Value::Object(map) = &mut payload {
        map.entry("_shop_domain".to_string())
            .or_insert_with(|| Value::String(store.shop_domain.clone()));
        if !event_type.is_empty() {
            map.entry("_event_type".to_string())
                .or_insert_with(|| Value::String(event_type.clone()));
        }
    }

    record_and_dispatch(
        &state,
        store.organization_id,
        Integration::Storefront,
        event_type,
        external_reference,
        webhook_id,
        payload,
    )
    .await
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// HMAC-SHA256 over the raw body, compared against the base64 header value.
fn verify_signature(secret: &str, body: &[u8], signature_b64: &str) -> bool {
    let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(signature_b64) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
