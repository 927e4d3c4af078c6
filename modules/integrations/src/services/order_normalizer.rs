//! Normalization of source payloads into the canonical order shape.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{json, Value};

use crate::errors::{IntegrationError, IntegrationResult};
use crate::models::Integration;

/// One sellable line of the canonical order.
#[derive(Debug, Clone)]
pub struct OrderLine {
    pub source_item_code: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub description: String,
    pub raw: Value,
}

/// Canonical order produced by normalization, independent of the source shape.
#[derive(Debug, Clone)]
pub struct NormalizedOrder {
    pub source: Integration,
    pub order_id: String,
    pub seller_company: String,
    pub distributor_company: String,
    pub customer_email: String,
    pub currency: Option<String>,
    pub totals: Value,
    pub created_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub lines: Vec<OrderLine>,
    pub metadata: Value,
}

impl NormalizedOrder {
    /// Snapshot persisted on the fulfillment order.
    pub fn summary(&self) -> Value {
        json!({
            "order_id": self.order_id,
            "source": self.source.as_str(),
            "seller_company": self.seller_company,
            "distributor_company": self.distributor_company,
            "customer_email": self.customer_email,
            "totals": self.totals,
        })
    }
}

pub fn normalize(
    source: Integration,
    payload: &Value,
    seller_company: &str,
    distributor_company: &str,
) -> IntegrationResult<NormalizedOrder> {
    match source {
        Integration::Storefront => normalize_storefront(payload, seller_company, distributor_company),
        Integration::ErpPos => normalize_erp(payload, seller_company, distributor_company),
        Integration::Accounting => Err(IntegrationError::fulfillment(
            "unsupported_source",
            format!("source {source} is not supported by the fulfillment pipeline"),
        )),
    }
}

fn normalize_storefront(
    payload: &Value,
    seller_company: &str,
    distributor_company: &str,
) -> IntegrationResult<NormalizedOrder> {
    let order_id = resolve_order_id(payload);
    let email = str_at(payload, "contact_email")
        .or_else(|| payload.get("customer").and_then(|c| str_at(c, "email")))
        .or_else(|| str_at(payload, "email"))
        .or_else(|| str_at(payload, "customer_email"))
        .unwrap_or_default();
    let currency = str_at(payload, "currency").or_else(|| str_at(payload, "presentment_currency"));
    let created_at = parse_datetime(payload.get("created_at"));
    let paid_at = parse_datetime(payload.get("processed_at"))
        .or_else(|| parse_datetime(payload.get("closed_at")));

    let mut lines = Vec::new();
    if let Some(raw_lines) = payload.get("line_items").and_then(Value::as_array) {
        for raw_line in raw_lines {
            if !raw_line.is_object() {
                continue;
            }
            let source_code = str_or_number(raw_line, "sku")
                .or_else(|| str_or_number(raw_line, "variant_id"))
                .or_else(|| str_or_number(raw_line, "product_id"))
                .or_else(|| str_or_number(raw_line, "id"))
                .or_else(|| str_or_number(raw_line, "title"));
            let Some(source_code) = source_code else {
                continue;
            };
            let quantity = to_number(raw_line.get("quantity"));
            if quantity <= 0.0 {
                continue;
            }
            let unit_price = to_number(raw_line.get("price"));
            let description = str_at(raw_line, "title")
                .or_else(|| str_at(raw_line, "name"))
                .unwrap_or_else(|| source_code.clone());
            lines.push(OrderLine {
                source_item_code: source_code,
                quantity,
                unit_price,
                description,
                raw: raw_line.clone(),
            });
        }
    }

    if lines.is_empty() {
        return Err(IntegrationError::fulfillment(
            "empty_order",
            "the storefront order contains no processable lines",
        ));
    }

    Ok(NormalizedOrder {
        source: Integration::Storefront,
        order_id,
        seller_company: seller_company.to_string(),
        distributor_company: distributor_company.to_string(),
        customer_email: email,
        currency,
        totals: json!({
            "total_price": payload.get("total_price").cloned().unwrap_or(Value::Null),
            "subtotal_price": payload.get("subtotal_price").cloned().unwrap_or(Value::Null),
            "total_tax": payload.get("total_tax").cloned().unwrap_or(Value::Null),
            "total_discount": payload.get("total_discounts").cloned().unwrap_or(Value::Null),
        }),
        created_at,
        paid_at,
        lines,
        metadata: json!({
            "shop_domain": payload.get("_shop_domain").cloned().unwrap_or(Value::Null)
        }),
    })
}

fn normalize_erp(
    payload: &Value,
    seller_company: &str,
    distributor_company: &str,
) -> IntegrationResult<NormalizedOrder> {
    let order_id = str_or_number(payload, "name").unwrap_or_else(|| resolve_order_id(payload));
    let email = str_at(payload, "custom_customer_email")
        .or_else(|| {
            let customer = payload
                .get("customer_details")
                .or_else(|| payload.get("customer"))?;
            str_at(customer, "email_id")
                .or_else(|| str_at(customer, "email"))
                .or_else(|| str_at(customer, "contact_email"))
        })
        .or_else(|| str_at(payload, "contact_email"))
        .unwrap_or_default();
    let created_at = parse_datetime(payload.get("posting_date"));

    let mut lines = Vec::new();
    if let Some(raw_lines) = payload.get("items").and_then(Value::as_array) {
        for raw_line in raw_lines {
            if !raw_line.is_object() {
                continue;
            }
            let source_code =
                str_or_number(raw_line, "item_code").or_else(|| str_or_number(raw_line, "item_name"));
            let Some(source_code) = source_code else {
                continue;
            };
            let quantity = to_number(raw_line.get("qty"));
            if quantity <= 0.0 {
                continue;
            }
            lines.push(OrderLine {
                source_item_code: source_code.clone(),
                quantity,
                unit_price: to_number(raw_line.get("rate")),
                description: str_at(raw_line, "description").unwrap_or(source_code),
                raw: raw_line.clone(),
            });
        }
    }

    if lines.is_empty() {
        return Err(IntegrationError::fulfillment(
            "empty_order",
            "the ERP invoice contains no processable lines",
        ));
    }

    Ok(NormalizedOrder {
        source: Integration::ErpPos,
        order_id,
        seller_company: seller_company.to_string(),
        distributor_company: distributor_company.to_string(),
        customer_email: email,
        currency: str_at(payload, "currency"),
        totals: json!({
            "grand_total": payload.get("grand_total").cloned().unwrap_or(Value::Null),
            "total": payload.get("total").cloned().unwrap_or(Value::Null),
        }),
        created_at,
        paid_at: None,
        lines,
        metadata: Value::Null,
    })
}

/// The order identity of a payload: first non-empty of
/// `order_id`, `id`, `name`, `external_reference`.
pub fn resolve_order_id(payload: &Value) -> String {
    for key in ["order_id", "id", "name", "external_reference"] {
        if let Some(value) = str_or_number(payload, key) {
            return value;
        }
    }
    String::new()
}

fn str_at(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn str_or_number(value: &Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn to_number(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn parse_datetime(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let text = value?.as_str()?.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(parsed.and_utc());
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return parsed.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storefront_order_normalizes_lines_and_identity() {
        let payload = json!({
            "id": 450789469,
            "contact_email": "buyer@example.com",
            "currency": "COP",
            "created_at": "2025-11-04T10:00:00-05:00",
            "total_price": "52000.00",
            "line_items": [
                { "sku": "SKU-1", "quantity": 2, "price": "25000.00", "title": "Widget" },
                { "sku": "SKU-GONE", "quantity": 0, "price": "1.00", "title": "Freebie" },
                { "variant_id": 99, "quantity": 1, "price": 2000, "title": "Addon" }
            ]
        });

        let order = normalize(Integration::Storefront, &payload, "ACME", "DIST").unwrap();
        assert_eq!(order.order_id, "450789469");
        assert_eq!(order.customer_email, "buyer@example.com");
        assert_eq!(order.lines.len(), 2);
        assert_eq!(order.lines[0].source_item_code, "SKU-1");
        assert_eq!(order.lines[0].quantity, 2.0);
        assert_eq!(order.lines[0].unit_price, 25000.0);
        assert_eq!(order.lines[1].source_item_code, "99");
        assert!(order.created_at.is_some());
    }

    #[test]
    fn storefront_without_lines_is_an_empty_order() {
        let payload = json!({ "id": 1, "line_items": [] });
        let err = normalize(Integration::Storefront, &payload, "A", "D").unwrap_err();
        assert_eq!(err.classify().error_code, "empty_order");
    }

    #[test]
    fn erp_invoice_normalizes_from_items() {
        let payload = json!({
            "name": "POS-000123",
            "posting_date": "2025-11-04",
            "currency": "COP",
            "grand_total": 52000,
            "custom_customer_email": "pos@example.com",
            "items": [
                { "item_code": "A", "qty": 1, "rate": 50000 },
                { "item_code": "B", "qty": 1, "rate": 2000 }
            ]
        });

        let order = normalize(Integration::ErpPos, &payload, "SELLER", "DIST").unwrap();
        assert_eq!(order.order_id, "POS-000123");
        assert_eq!(order.customer_email, "pos@example.com");
        assert_eq!(order.lines.len(), 2);
        assert_eq!(order.totals.get("grand_total"), Some(&json!(52000)));
    }

    #[test]
    fn erp_email_falls_back_through_customer_details() {
        let payload = json!({
            "name": "SINV-1",
            "customer_details": { "email_id": "nested@example.com" },
            "items": [ { "item_code": "A", "qty": 1, "rate": 10 } ]
        });
        let order = normalize(Integration::ErpPos, &payload, "S", "D").unwrap();
        assert_eq!(order.customer_email, "nested@example.com");
    }

    #[test]
    fn order_id_resolution_walks_candidate_keys() {
        assert_eq!(resolve_order_id(&json!({"order_id": "O-1"})), "O-1");
        assert_eq!(resolve_order_id(&json!({"id": 7})), "7");
        assert_eq!(resolve_order_id(&json!({"name": "N-1"})), "N-1");
        assert_eq!(
            resolve_order_id(&json!({"external_reference": "X-1"})),
            "X-1"
        );
        assert_eq!(resolve_order_id(&json!({})), "");
    }

    #[test]
    fn datetime_parsing_accepts_common_formats() {
        assert!(parse_datetime(Some(&json!("2025-11-04T10:00:00Z"))).is_some());
        assert!(parse_datetime(Some(&json!("2025-11-04 10:00:00"))).is_some());
        assert!(parse_datetime(Some(&json!("2025-11-04"))).is_some());
        assert!(parse_datetime(Some(&json!("garbage"))).is_none());
        assert!(parse_datetime(None).is_none());
    }
}
