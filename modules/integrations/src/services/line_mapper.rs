//! Resolution of source line items into distributor items and warehouses.

use std::collections::{BTreeSet, HashMap};

use serde_json::{json, Value};

use crate::errors::{IntegrationError, IntegrationResult};
use crate::models::FulfillmentItemMap;
use crate::services::gateway_settings::GatewaySettings;
use crate::services::order_normalizer::NormalizedOrder;

/// A normalized line resolved to its distributor-side identity.
#[derive(Debug, Clone)]
pub struct MappedLine {
    pub source_item_code: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub description: String,
    pub target_item_code: String,
    pub target_company: String,
    pub warehouse: Option<String>,
    pub serial_numbers: Vec<String>,
}

/// Map every order line: the item-map table wins, then the metadata
/// `item_map`, then the identity fallback (source code = target code).
///
/// All lines must resolve to a single target company.
pub fn map_lines(
    order: &NormalizedOrder,
    item_maps: &[FulfillmentItemMap],
    settings: &GatewaySettings,
) -> IntegrationResult<(Vec<MappedLine>, Value)> {
    let index: HashMap<&str, &FulfillmentItemMap> = item_maps
        .iter()
        .map(|entry| (entry.source_item_code.as_str(), entry))
        .collect();

    let mut mapped_lines = Vec::with_capacity(order.lines.len());
    let mut target_companies: BTreeSet<String> = BTreeSet::new();

    for line in &order.lines {
        let (target_item_code, target_company, warehouse) =
            match index.get(line.source_item_code.as_str()) {
                Some(entry) => {
                    let company = if entry.target_company.is_empty() {
                        order.distributor_company.clone()
                    } else {
                        entry.target_company.clone()
                    };
                    let warehouse = if !entry.warehouse.is_empty() {
                        Some(entry.warehouse.clone())
                    } else {
                        entry
                            .metadata
                            .get("warehouse")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    };
                    (entry.target_item_code.clone(), company, warehouse)
                }
                None => match settings.metadata_item_mapping(
                    order.source,
                    &order.seller_company,
                    &line.source_item_code,
                ) {
                    Some(entry) => (
                        entry.target_item_code.unwrap_or_default(),
                        entry
                            .target_company
                            .unwrap_or_else(|| order.distributor_company.clone()),
                        entry.warehouse,
                    ),
                    None => (
                        line.source_item_code.clone(),
                        order.distributor_company.clone(),
                        None,
                    ),
                },
            };

        if target_item_code.is_empty() {
            return Err(IntegrationError::fulfillment(
                "invalid_item_map",
                format!(
                    "the item map for '{}' does not define a target item code",
                    line.source_item_code
                ),
            ));
        }

        target_companies.insert(target_company.clone());
        mapped_lines.push(MappedLine {
            source_item_code: line.source_item_code.clone(),
            quantity: line.quantity,
            unit_price: line.unit_price,
            description: line.description.clone(),
            target_item_code,
            target_company,
            warehouse: warehouse.or_else(|| settings.default_warehouse()),
            serial_numbers: Vec::new(),
        });
    }

    if target_companies.len() > 1 {
        return Err(IntegrationError::fulfillment(
            "multiple_target_companies",
            format!(
                "the order maps to multiple target companies: {}",
                target_companies
                    .into_iter()
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ));
    }

    let snapshot = build_snapshot(&mapped_lines);
    Ok((mapped_lines, snapshot))
}

fn build_snapshot(mapped_lines: &[MappedLine]) -> Value {
    json!({
        "lines": mapped_lines
            .iter()
            .map(|line| json!({
                "source_item_code": line.source_item_code,
                "target_item_code": line.target_item_code,
                "warehouse": line.warehouse,
                "quantity": line.quantity,
                "unit_price": line.unit_price,
            }))
            .collect::<Vec<_>>()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Integration;
    use crate::services::order_normalizer::OrderLine;
    use uuid::Uuid;

    fn order(codes: &[&str]) -> NormalizedOrder {
        NormalizedOrder {
            source: Integration::Storefront,
            order_id: "O-1".into(),
            seller_company: "ACME".into(),
            distributor_company: "DIST".into(),
            customer_email: String::new(),
            currency: None,
            totals: Value::Null,
            created_at: None,
            paid_at: None,
            lines: codes
                .iter()
                .map(|code| OrderLine {
                    source_item_code: code.to_string(),
                    quantity: 1.0,
                    unit_price: 10.0,
                    description: code.to_string(),
                    raw: Value::Null,
                })
                .collect(),
            metadata: Value::Null,
        }
    }

    fn table_entry(source: &str, target: &str, company: &str, warehouse: &str) -> FulfillmentItemMap {
        FulfillmentItemMap {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            source: Integration::Storefront,
            source_company: "ACME".into(),
            source_item_code: source.into(),
            target_company: company.into(),
            target_item_code: target.into(),
            warehouse: warehouse.into(),
            metadata: json!({}),
            is_active: true,
        }
    }

    fn settings(raw: Value) -> GatewaySettings {
        GatewaySettings::from_metadata(&json!({ "fulfillment_gateway": raw })).unwrap()
    }

    #[test]
    fn table_entries_win_over_fallbacks() {
        let maps = vec![table_entry("SKU-1", "TGT-1", "DIST", "Main - DIST")];
        let (lines, snapshot) =
            map_lines(&order(&["SKU-1"]), &maps, &settings(json!({}))).unwrap();
        assert_eq!(lines[0].target_item_code, "TGT-1");
        assert_eq!(lines[0].warehouse.as_deref(), Some("Main - DIST"));
        assert_eq!(snapshot["lines"][0]["target_item_code"], json!("TGT-1"));
    }

    #[test]
    fn metadata_map_is_the_second_fallback() {
        let s = settings(json!({
            "item_map": { "storefront": { "ACME": { "SKU-2": "META-2" } } }
        }));
        let (lines, _) = map_lines(&order(&["SKU-2"]), &[], &s).unwrap();
        assert_eq!(lines[0].target_item_code, "META-2");
        assert_eq!(lines[0].target_company, "DIST");
    }

    #[test]
    fn identity_fallback_keeps_the_source_code() {
        let s = settings(json!({ "default_warehouse": "WH - DIST" }));
        let (lines, _) = map_lines(&order(&["RAW-3"]), &[], &s).unwrap();
        assert_eq!(lines[0].target_item_code, "RAW-3");
        assert_eq!(lines[0].warehouse.as_deref(), Some("WH - DIST"));
    }

    #[test]
    fn divergent_target_companies_fail() {
        let maps = vec![
            table_entry("SKU-A", "TGT-A", "DIST-1", ""),
            table_entry("SKU-B", "TGT-B", "DIST-2", ""),
        ];
        let err = map_lines(&order(&["SKU-A", "SKU-B"]), &maps, &settings(json!({}))).unwrap_err();
        assert_eq!(err.classify().error_code, "multiple_target_companies");
    }

    #[test]
    fn empty_target_item_code_fails() {
        let maps = vec![table_entry("SKU-X", "", "DIST", "")];
        let err = map_lines(&order(&["SKU-X"]), &maps, &settings(json!({}))).unwrap_err();
        assert_eq!(err.classify().error_code, "invalid_item_map");
    }
}
