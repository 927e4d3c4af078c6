//! ERP POS webhook ingress: tenant-scoped document submissions.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;
use uuid::Uuid;

use crate::models::Integration;
use crate::routes::accounting::scoped_key;
use crate::routes::{record_and_dispatch, AcceptedResponse, RouteError};
use crate::AppState;

/// POST `/webhooks/erp/{organization_id}`
///
/// The ERP sends no cryptographic signature; tenancy comes from the URL path.
/// The event type is derived from the document type and hook event
/// (`POS Invoice` + `on_submit` → `pos_invoice.on_submit`).
pub async fn erp_webhook(
    State(state): State<Arc<AppState>>,
    Path(organization_id): Path<Uuid>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<AcceptedResponse>), RouteError> {
    let event_type = derive_event_type(&payload);
    let external_reference = payload
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let idempotency_key = scoped_key(&event_type, &external_reference);

    record_and_dispatch(
        &state,
        organization_id,
        Integration::ErpPos,
        event_type,
        external_reference,
        idempotency_key,
        payload,
    )
    .await
}

fn derive_event_type(payload: &Value) -> String {
    let event = payload
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim();
    let doctype = payload
        .get("doctype")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim();

    match (doctype.is_empty(), event.is_empty()) {
        (false, false) => format!("{}.{event}", doctype.to_lowercase().replace(' ', "_")),
        (true, false) => event.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_combines_doctype_and_event() {
        assert_eq!(
            derive_event_type(&json!({ "doctype": "POS Invoice", "event": "on_submit" })),
            "pos_invoice.on_submit"
        );
        assert_eq!(
            derive_event_type(&json!({ "doctype": "Sales Invoice", "event": "on_submit" })),
            "sales_invoice.on_submit"
        );
        assert_eq!(
            derive_event_type(&json!({ "event": "on_submit" })),
            "on_submit"
        );
        assert_eq!(derive_event_type(&json!({ "doctype": "Sales Invoice" })), "");
        assert_eq!(derive_event_type(&json!({})), "");
    }
}
