//! Return delivery notes for previously fulfilled orders.

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::clients::ErpClient;
use crate::errors::{IntegrationError, IntegrationResult};
use crate::models::FulfillmentOrder;
use crate::repos::{fulfillment_repo, organization_repo};
use crate::services::gateway_settings::GatewaySettings;

/// Create and submit a return against a fulfilled order's delivery note.
pub async fn process_return(
    pool: &PgPool,
    organization_id: Uuid,
    fulfillment_order_id: Uuid,
    reason: &str,
    warehouse_override: Option<&str>,
) -> IntegrationResult<Value> {
    let order = fulfillment_repo::get_for_organization(pool, organization_id, fulfillment_order_id)
        .await?
        .ok_or_else(|| {
            IntegrationError::configuration(format!(
                "fulfillment order {fulfillment_order_id} not found"
            ))
        })?;

    if order.delivery_note_name.is_empty() {
        return Err(IntegrationError::fulfillment(
            "missing_delivery_note",
            "cannot create a return without a prior delivery note",
        ));
    }

    let line_serials = line_serials(&order);
    if line_serials.is_empty() {
        return Err(IntegrationError::fulfillment(
            "missing_serials",
            "no recorded serials or line snapshot to build the return from",
        ));
    }

    let organization = organization_repo::get(pool, organization_id)
        .await?
        .ok_or_else(|| {
            IntegrationError::configuration(format!("organization {organization_id} not found"))
        })?;
    let settings = GatewaySettings::from_metadata(&organization.metadata)?;

    let client = ErpClient::for_company(pool, organization_id, Some(&order.distributor_company))
        .await
        .map_err(|_| {
            IntegrationError::configuration(format!(
                "no active ERP credential for distributor company {}",
                order.distributor_company
            ))
        })?;

    let payload = return_payload(&order, &line_serials, warehouse_override, &settings);
    let response = client
        .insert_doc("Delivery Note", &payload, &order.order_id)
        .await?;
    let return_dn = response
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            IntegrationError::fulfillment(
                "return_creation",
                "the upstream did not return a name for the return delivery note",
            )
        })?;

    let submit_response = client.submit_doc("Delivery Note", &return_dn).await?;
    if submit_response.get("docstatus").and_then(Value::as_i64) != Some(1) {
        return Err(IntegrationError::fulfillment(
            "return_submit",
            format!("return delivery note {return_dn} was not committed on submit"),
        ));
    }

    fulfillment_repo::record_return(
        pool,
        order.id,
        &return_dn,
        &json!({
            "reason": reason,
            "line_serials": line_serials,
            "requested_at": Utc::now().to_rfc3339(),
        }),
    )
    .await?;

    tracing::info!(
        order_id = %order.order_id,
        return_delivery_note = %return_dn,
        "created return delivery note"
    );

    Ok(json!({
        "return_delivery_note": return_dn,
        "original_delivery_note": order.delivery_note_name,
        "line_serials": line_serials,
    }))
}

/// The per-line serial breakdown: prefer the recorded `line_serials`, else
/// re-derive it by slicing the flat serial list along the mapping snapshot.
fn line_serials(order: &FulfillmentOrder) -> Vec<Value> {
    if let Some(recorded) = order
        .result_payload
        .get("line_serials")
        .and_then(Value::as_array)
    {
        if !recorded.is_empty() {
            return recorded.clone();
        }
    }

    let snapshot = order
        .fulfillment_payload
        .get("lines")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let serials: Vec<String> = order
        .serial_numbers
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut derived = Vec::new();
    let mut index = 0usize;
    for entry in snapshot {
        let quantity = entry
            .get("quantity")
            .map(|q| match q {
                Value::Number(n) => n.as_f64().unwrap_or(0.0),
                Value::String(s) => s.parse::<f64>().unwrap_or(0.0),
                _ => 0.0,
            })
            .unwrap_or(0.0) as usize;
        let end = (index + quantity).min(serials.len());
        let chunk: Vec<String> = serials[index..end].to_vec();
        index = end;
        derived.push(json!({
            "item_code": entry.get("target_item_code").cloned().unwrap_or(Value::Null),
            "warehouse": entry.get("warehouse").cloned().unwrap_or(Value::Null),
            "quantity": quantity,
            "serials": chunk,
        }));
    }
    derived
}

fn return_payload(
    order: &FulfillmentOrder,
    line_serials: &[Value],
    warehouse_override: Option<&str>,
    settings: &GatewaySettings,
) -> Value {
    let items: Vec<Value> = line_serials
        .iter()
        .filter_map(|entry| {
            let serials: Vec<&str> = entry
                .get("serials")
                .and_then(Value::as_array)
                .map(|list| list.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if serials.is_empty() {
                return None;
            }
            let quantity = entry
                .get("quantity")
                .and_then(Value::as_f64)
                .unwrap_or(serials.len() as f64);
            let warehouse = warehouse_override
                .map(str::to_string)
                .or_else(|| {
                    entry
                        .get("warehouse")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .or_else(|| settings.default_warehouse());
            Some(json!({
                "item_code": entry.get("item_code").cloned().unwrap_or(Value::Null),
                "qty": quantity,
                "serial_no": serials.join("\n"),
                "warehouse": warehouse,
            }))
        })
        .collect();

    json!({
        "doctype": "Delivery Note",
        "company": order.distributor_company,
        "customer": order.seller_company,
        "posting_date": Utc::now().date_naive().to_string(),
        "is_return": 1,
        "return_against": order.delivery_note_name,
        "items": items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FulfillmentStatus, Integration};

    fn order_with(result_payload: Value, fulfillment_payload: Value, serials: Value) -> FulfillmentOrder {
        FulfillmentOrder {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            source: Integration::Storefront,
            order_id: "O-1".into(),
            seller_company: "ACME".into(),
            distributor_company: "DIST".into(),
            status: FulfillmentStatus::Fulfilled,
            payload: Value::Null,
            normalized_order: Value::Null,
            fulfillment_payload,
            result_payload,
            serial_numbers: serials,
            sales_order_name: String::new(),
            delivery_note_name: "DN-1".into(),
            delivery_note_submitted_at: None,
            return_delivery_note_name: String::new(),
            return_delivery_note_submitted_at: None,
            return_payload: Value::Null,
            backorder_attempts: 0,
            last_error_code: String::new(),
            last_error_message: String::new(),
            next_attempt_at: None,
            source_message_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn recorded_line_serials_are_preferred() {
        let recorded = json!([{ "item_code": "A", "serials": ["S1"], "quantity": 1 }]);
        let order = order_with(json!({ "line_serials": recorded }), json!({}), json!([]));
        assert_eq!(line_serials(&order), recorded.as_array().unwrap().clone());
    }

    #[test]
    fn line_serials_are_derived_from_snapshot_chunks() {
        let order = order_with(
            json!({}),
            json!({ "lines": [
                { "target_item_code": "A", "warehouse": "W1", "quantity": 2 },
                { "target_item_code": "B", "warehouse": "W2", "quantity": 1 }
            ]}),
            json!(["S1", "S2", "S3"]),
        );
        let derived = line_serials(&order);
        assert_eq!(derived.len(), 2);
        assert_eq!(derived[0]["serials"], json!(["S1", "S2"]));
        assert_eq!(derived[1]["serials"], json!(["S3"]));
    }

    #[test]
    fn return_payload_references_the_original_note() {
        let order = order_with(json!({}), json!({}), json!([]));
        let entries = vec![json!({
            "item_code": "A", "warehouse": "W1", "quantity": 1, "serials": ["S1"]
        })];
        let settings =
            GatewaySettings::from_metadata(&json!({ "fulfillment_gateway": {} })).unwrap();
        let payload = return_payload(&order, &entries, None, &settings);
        assert_eq!(payload["is_return"], json!(1));
        assert_eq!(payload["return_against"], json!("DN-1"));
        assert_eq!(payload["items"][0]["serial_no"], json!("S1"));
    }

    #[test]
    fn entries_without_serials_are_dropped_from_the_return() {
        let order = order_with(json!({}), json!({}), json!([]));
        let entries = vec![json!({ "item_code": "A", "quantity": 1, "serials": [] })];
        let settings =
            GatewaySettings::from_metadata(&json!({ "fulfillment_gateway": {} })).unwrap();
        let payload = return_payload(&order, &entries, None, &settings);
        assert_eq!(payload["items"], json!([]));
    }
}
