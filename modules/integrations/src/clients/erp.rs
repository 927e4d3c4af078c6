//! Client for the ERP upstream (documents, stock, serials).

use reqwest::Method;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::clients::outbound::{AuthScheme, OutboundClient};
use crate::errors::{IntegrationError, IntegrationResult};
use crate::models::{ErpCredential, Integration};
use crate::repos::credential_repo;

pub struct ErpClient {
    outbound: OutboundClient,
    credential: ErpCredential,
}

impl ErpClient {
    pub fn new(pool: PgPool, credential: ErpCredential) -> IntegrationResult<Self> {
        let outbound = OutboundClient::new(
            pool,
            credential.organization_id,
            Integration::ErpPos,
            credential.base_url.clone(),
            AuthScheme::TokenPair {
                key: credential.api_key.clone(),
                secret: credential.api_secret.clone(),
            },
            credential.timeout_s,
        )?;
        Ok(Self {
            outbound,
            credential,
        })
    }

    /// Build a client for the credential serving `company` under the tenant.
    pub async fn for_company(
        pool: &PgPool,
        organization_id: Uuid,
        company: Option<&str>,
    ) -> IntegrationResult<Self> {
        let credential = credential_repo::erp_for_company(pool, organization_id, company)
            .await?
            .ok_or_else(|| {
                IntegrationError::Credential(format!(
                    "no active ERP credential for organization {organization_id} (company {})",
                    company.unwrap_or("<any>")
                ))
            })?;
        Self::new(pool.clone(), credential)
    }

    pub fn credential(&self) -> &ErpCredential {
        &self.credential
    }

    /// Insert a document and return its body (`data` envelope unwrapped).
    pub async fn insert_doc(
        &self,
        doctype: &str,
        payload: &Value,
        external_reference: &str,
    ) -> IntegrationResult<Value> {
        let response = self
            .outbound
            .request(
                Method::POST,
                &format!("api/resource/{doctype}"),
                None,
                Some(payload),
                &doc_event_type(doctype, "insert"),
                external_reference,
            )
            .await?;
        Ok(unwrap_data(response))
    }

    /// Submit a document (docstatus 0 → 1) and return the updated body.
    pub async fn submit_doc(&self, doctype: &str, name: &str) -> IntegrationResult<Value> {
        let response = self
            .outbound
            .request(
                Method::PUT,
                &format!("api/resource/{doctype}/{name}"),
                None,
                Some(&json!({ "docstatus": 1 })),
                &doc_event_type(doctype, "submit"),
                name,
            )
            .await?;
        Ok(unwrap_data(response))
    }

    /// Patch fields on an existing document.
    pub async fn update_doc(
        &self,
        doctype: &str,
        name: &str,
        patch: &Value,
    ) -> IntegrationResult<Value> {
        let response = self
            .outbound
            .request(
                Method::PUT,
                &format!("api/resource/{doctype}/{name}"),
                None,
                Some(patch),
                &doc_event_type(doctype, "update"),
                name,
            )
            .await?;
        Ok(unwrap_data(response))
    }

    pub async fn get_doc(&self, doctype: &str, name: &str) -> IntegrationResult<Value> {
        let response = self
            .outbound
            .request(
                Method::GET,
                &format!("api/resource/{doctype}/{name}"),
                None,
                None,
                &doc_event_type(doctype, "fetch"),
                name,
            )
            .await?;
        Ok(unwrap_data(response))
    }

    /// Stock rows (`Bin` doctype) for an item, optionally narrowed to one
    /// warehouse. Each row carries `item_code`, `warehouse`, `actual_qty`.
    pub async fn list_stock_levels(
        &self,
        item_code: &str,
        warehouse: Option<&str>,
        external_reference: &str,
    ) -> IntegrationResult<Vec<Value>> {
        let mut filters = vec![json!(["item_code", "=", item_code])];
        if let Some(warehouse) = warehouse {
            filters.push(json!(["warehouse", "=", warehouse]));
        }
        let params = [
            (
                "filters".to_string(),
                serde_json::to_string(&filters).unwrap_or_default(),
            ),
            (
                "fields".to_string(),
                r#"["item_code","warehouse","actual_qty"]"#.to_string(),
            ),
            ("limit_page_length".to_string(), "100".to_string()),
        ];
        let response = self
            .outbound
            .request(
                Method::GET,
                "api/resource/Bin",
                Some(&params),
                None,
                "bin.list",
                external_reference,
            )
            .await?;
        as_rows(response)
    }

    /// Serial numbers available for an item/warehouse in a given status.
    pub async fn list_serial_numbers(
        &self,
        item_code: &str,
        warehouse: Option<&str>,
        status: &str,
        limit: usize,
        offset: usize,
    ) -> IntegrationResult<Vec<Value>> {
        let mut filters = vec![
            json!(["item_code", "=", item_code]),
            json!(["status", "=", status]),
        ];
        if let Some(warehouse) = warehouse {
            filters.push(json!(["warehouse", "=", warehouse]));
        }
        let params = [
            (
                "filters".to_string(),
                serde_json::to_string(&filters).unwrap_or_default(),
            ),
            ("fields".to_string(), r#"["name","serial_no"]"#.to_string()),
            ("limit_page_length".to_string(), limit.to_string()),
            ("limit_start".to_string(), offset.to_string()),
        ];
        let response = self
            .outbound
            .request(
                Method::GET,
                "api/resource/Serial No",
                Some(&params),
                None,
                "serial_no.list",
                item_code,
            )
            .await?;
        as_rows(response)
    }
}

fn doc_event_type(doctype: &str, action: &str) -> String {
    let slug = doctype.trim().to_lowercase().replace(' ', "_");
    format!("{slug}.{action}")
}

fn unwrap_data(response: Value) -> Value {
    match response {
        Value::Object(mut map) => map.remove("data").unwrap_or_else(|| Value::Object(map)),
        other => other,
    }
}

fn as_rows(response: Value) -> IntegrationResult<Vec<Value>> {
    match unwrap_data(response) {
        Value::Array(rows) => Ok(rows),
        other => Err(IntegrationError::Api {
            message: "upstream returned an unexpected list shape".into(),
            status_code: None,
            error_code: "unknown_error".into(),
            retryable: false,
            body: other,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_event_types_are_snake_cased() {
        assert_eq!(doc_event_type("Sales Order", "insert"), "sales_order.insert");
        assert_eq!(
            doc_event_type("Delivery Note", "submit"),
            "delivery_note.submit"
        );
        assert_eq!(doc_event_type("Bin", "fetch"), "bin.fetch");
    }

    #[test]
    fn data_envelope_is_unwrapped() {
        assert_eq!(
            unwrap_data(json!({"data": {"name": "DN-1"}})),
            json!({"name": "DN-1"})
        );
        assert_eq!(unwrap_data(json!({"name": "DN-1"})), json!({"name": "DN-1"}));
        assert_eq!(unwrap_data(json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn list_responses_must_be_arrays() {
        assert!(as_rows(json!({"data": [1]})).is_ok());
        assert!(as_rows(json!({"data": {"not": "a list"}})).is_err());
    }
}
