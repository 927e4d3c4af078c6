//! Typed view over the tenant's `fulfillment_gateway` configuration surface.

use serde_json::Value;

use crate::errors::{IntegrationError, IntegrationResult};
use crate::models::Integration;

/// Entry resolved from the metadata item map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataItemEntry {
    pub target_item_code: Option<String>,
    pub target_company: Option<String>,
    pub warehouse: Option<String>,
}

/// Wrapper around `organization.metadata.fulfillment_gateway`.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    raw: Value,
}

impl GatewaySettings {
    pub fn from_metadata(metadata: &Value) -> IntegrationResult<Self> {
        let raw = metadata
            .get("fulfillment_gateway")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        if !raw.is_object() {
            return Err(IntegrationError::configuration(
                "metadata.fulfillment_gateway must be a JSON object",
            ));
        }
        Ok(Self { raw })
    }

    /// Target company for all fulfillment documents; required.
    pub fn distributor_company(&self) -> String {
        self.str_key("distributor_company")
            .or_else(|| self.str_key("distributor"))
            .unwrap_or_default()
    }

    /// Fallback warehouse when no mapping supplies one.
    pub fn default_warehouse(&self) -> Option<String> {
        if let Some(warehouse) = self.str_key("default_warehouse") {
            return Some(warehouse);
        }
        self.raw
            .get("distributor")
            .and_then(|d| d.get("warehouse"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn create_sales_order(&self) -> bool {
        self.raw
            .get("create_sales_order")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// Serial status filter for pre-allocation.
    pub fn serial_status(&self) -> String {
        self.str_key("serial_status")
            .unwrap_or_else(|| "Available".to_string())
    }

    /// Whether serials are pre-allocated into the delivery note lines.
    /// Default is delegated allocation: the upstream assigns serials itself.
    pub fn preallocate_serials(&self) -> bool {
        self.raw
            .get("preallocate_serials")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn backorder_retry_seconds(&self) -> i64 {
        self.raw
            .get("backorder")
            .and_then(|b| b.get("retry_delay_seconds"))
            .and_then(Value::as_i64)
            .filter(|v| *v > 0)
            .unwrap_or(900)
    }

    /// Static mapping from the metadata `item_map[source][company][code]`
    /// tree; company and code lookups also try their uppercase form, and
    /// `"*"` matches any company.
    pub fn metadata_item_mapping(
        &self,
        source: Integration,
        seller_company: &str,
        source_item_code: &str,
    ) -> Option<MetadataItemEntry> {
        let by_source = self.raw.get("item_map")?.get(source.as_str())?;
        let company_map = by_source
            .get(seller_company)
            .or_else(|| by_source.get(&seller_company.to_uppercase()))
            .or_else(|| by_source.get("*"))?;
        let entry = company_map
            .get(source_item_code)
            .or_else(|| company_map.get(&source_item_code.to_uppercase()))?;

        match entry {
            Value::String(code) => Some(MetadataItemEntry {
                target_item_code: Some(code.clone()),
                target_company: None,
                warehouse: None,
            }),
            Value::Object(map) => Some(MetadataItemEntry {
                target_item_code: map
                    .get("target_item_code")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                target_company: map
                    .get("target_company")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                warehouse: map
                    .get("warehouse")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            _ => None,
        }
    }

    /// Infer the seller company from payload + configuration: explicit
    /// payload fields win, then the per-source selector rules, then the
    /// configured default.
    pub fn resolve_seller_company(&self, source: Integration, payload: &Value) -> String {
        for key in ["company_seller", "seller_company", "company"] {
            if let Some(value) = payload.get(key).and_then(Value::as_str) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }

        let config = self.seller_config(source);
        if source == Integration::Storefront {
            if let Some(selector) = config.get("company_selector") {
                let company = resolve_storefront_company(selector, payload);
                if !company.is_empty() {
                    return company;
                }
            }
        }

        config
            .get("default_company")
            .and_then(Value::as_str)
            .or_else(|| {
                self.raw
                    .get("default_seller_company")
                    .and_then(Value::as_str)
            })
            .unwrap_or("")
            .trim()
            .to_string()
    }

    fn seller_config(&self, source: Integration) -> Value {
        self.raw
            .get("sellers")
            .and_then(|s| s.get(source.as_str()))
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    fn str_key(&self, key: &str) -> Option<String> {
        self.raw
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Selector rules for deriving the seller company from a storefront payload:
/// a tag prefix (`cia:ACME` → `ACME`) and a shop-domain map.
fn resolve_storefront_company(selector: &Value, payload: &Value) -> String {
    if !selector.is_object() {
        return String::new();
    }

    let tag_source = selector.get("source").and_then(Value::as_str);
    let prefix = selector.get("prefix").and_then(Value::as_str);
    if tag_source == Some("tags") {
        if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
            if let Some(tags) = payload.get("tags").and_then(Value::as_str) {
                for tag in tags.split(',').map(str::trim) {
                    if let Some(company) = tag.strip_prefix(prefix) {
                        let company = company.trim();
                        if !company.is_empty() {
                            return company.to_string();
                        }
                    }
                }
            }
        }
    }

    if let Some(domain_map) = selector.get("domain_map").and_then(Value::as_object) {
        let domain = payload
            .get("_shop_domain")
            .or_else(|| payload.get("domain"))
            .and_then(Value::as_str);
        if let Some(domain) = domain {
            let mapped = domain_map
                .get(domain)
                .or_else(|| domain_map.get(&domain.to_lowercase()))
                .and_then(Value::as_str);
            if let Some(mapped) = mapped {
                return mapped.to_string();
            }
        }
    }

    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(raw: Value) -> GatewaySettings {
        GatewaySettings::from_metadata(&json!({ "fulfillment_gateway": raw })).unwrap()
    }

    #[test]
    fn defaults_apply_when_keys_are_absent() {
        let s = settings(json!({}));
        assert_eq!(s.distributor_company(), "");
        assert_eq!(s.default_warehouse(), None);
        assert!(s.create_sales_order());
        assert!(!s.preallocate_serials());
        assert_eq!(s.serial_status(), "Available");
        assert_eq!(s.backorder_retry_seconds(), 900);
    }

    #[test]
    fn rejects_non_object_gateway_config() {
        let err = GatewaySettings::from_metadata(&json!({ "fulfillment_gateway": "oops" }))
            .err()
            .unwrap();
        assert_eq!(err.classify().error_code, "configuration_error");
    }

    #[test]
    fn seller_company_prefers_explicit_payload_fields() {
        let s = settings(json!({ "default_seller_company": "DEF" }));
        let payload = json!({ "company": "ACME " });
        assert_eq!(
            s.resolve_seller_company(Integration::ErpPos, &payload),
            "ACME"
        );
    }

    #[test]
    fn storefront_tags_selector_wins_over_domain_map() {
        let s = settings(json!({
            "sellers": {
                "storefront": {
                    "company_selector": {
                        "source": "tags",
                        "prefix": "cia:",
                        "domain_map": { "shop.example.com": "DOMCO" }
                    },
                    "default_company": "DEF"
                }
            }
        }));
        let payload = json!({
            "tags": "vip, cia:TAGCO",
            "_shop_domain": "shop.example.com"
        });
        assert_eq!(
            s.resolve_seller_company(Integration::Storefront, &payload),
            "TAGCO"
        );
    }

    #[test]
    fn storefront_domain_map_applies_without_tags() {
        let s = settings(json!({
            "sellers": {
                "storefront": {
                    "company_selector": {
                        "domain_map": { "shop.example.com": "DOMCO" }
                    }
                }
            }
        }));
        let payload = json!({ "_shop_domain": "shop.example.com" });
        assert_eq!(
            s.resolve_seller_company(Integration::Storefront, &payload),
            "DOMCO"
        );
    }

    #[test]
    fn falls_back_to_default_company() {
        let s = settings(json!({
            "sellers": { "storefront": { "default_company": "DEF" } }
        }));
        assert_eq!(
            s.resolve_seller_company(Integration::Storefront, &json!({})),
            "DEF"
        );
    }

    #[test]
    fn metadata_item_map_resolves_strings_and_objects() {
        let s = settings(json!({
            "item_map": {
                "storefront": {
                    "ACME": {
                        "SKU-1": "TARGET-1",
                        "SKU-2": {
                            "target_item_code": "TARGET-2",
                            "target_company": "DIST",
                            "warehouse": "Main"
                        }
                    },
                    "*": { "SKU-3": "WILD-3" }
                }
            }
        }));

        let simple = s
            .metadata_item_mapping(Integration::Storefront, "ACME", "SKU-1")
            .unwrap();
        assert_eq!(simple.target_item_code.as_deref(), Some("TARGET-1"));
        assert_eq!(simple.target_company, None);

        let detailed = s
            .metadata_item_mapping(Integration::Storefront, "ACME", "SKU-2")
            .unwrap();
        assert_eq!(detailed.target_company.as_deref(), Some("DIST"));
        assert_eq!(detailed.warehouse.as_deref(), Some("Main"));

        let wildcard = s
            .metadata_item_mapping(Integration::Storefront, "OTHER", "SKU-3")
            .unwrap();
        assert_eq!(wildcard.target_item_code.as_deref(), Some("WILD-3"));

        assert!(s
            .metadata_item_mapping(Integration::Storefront, "ACME", "MISSING")
            .is_none());
    }
}
