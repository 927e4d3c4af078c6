//! Client for the accounting upstream (contacts and invoices).

use chrono::Utc;
use reqwest::Method;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::clients::outbound::{AuthScheme, OutboundClient};
use crate::errors::{IntegrationError, IntegrationResult};
use crate::models::{AccountingCredential, Integration};
use crate::repos::credential_repo;

pub struct AccountingClient {
    outbound: OutboundClient,
    credential: AccountingCredential,
}

impl AccountingClient {
    pub fn new(pool: PgPool, credential: AccountingCredential) -> IntegrationResult<Self> {
        if !credential.is_valid(Utc::now()) {
            return Err(IntegrationError::Credential(
                "accounting credential is inactive or outside its validity window".into(),
            ));
        }
        let outbound = OutboundClient::new(
            pool,
            credential.organization_id,
            Integration::Accounting,
            credential.base_url.clone(),
            AuthScheme::Basic {
                username: credential.email.clone(),
                password: credential.token.clone(),
            },
            credential.timeout_s,
        )?;
        Ok(Self {
            outbound,
            credential,
        })
    }

    /// Select the tenant's credential, preferring a company match, and build
    /// a client over it.
    pub async fn for_organization(
        pool: &PgPool,
        organization_id: Uuid,
        company: Option<&str>,
    ) -> IntegrationResult<Self> {
        let credential = credential_repo::accounting_for_company(pool, organization_id, company)
            .await?
            .ok_or_else(|| {
                IntegrationError::Credential(format!(
                    "no active accounting credential for organization {organization_id}"
                ))
            })?;
        Self::new(pool.clone(), credential)
    }

    pub fn credential(&self) -> &AccountingCredential {
        &self.credential
    }

    pub fn metadata(&self) -> &Value {
        &self.credential.metadata
    }

    pub async fn get_contact(
        &self,
        contact_id: &str,
        external_reference: &str,
    ) -> IntegrationResult<Value> {
        self.outbound
            .request(
                Method::GET,
                &format!("contacts/{contact_id}"),
                None,
                None,
                "erpnext.contact.fetch",
                external_reference,
            )
            .await
    }

    pub async fn search_contacts(
        &self,
        term: &str,
        external_reference: &str,
    ) -> IntegrationResult<Value> {
        let params = [("term".to_string(), term.to_string())];
        self.outbound
            .request(
                Method::GET,
                "contacts",
                Some(&params),
                None,
                "erpnext.contact.lookup",
                external_reference,
            )
            .await
    }

    pub async fn create_contact(
        &self,
        payload: &Value,
        external_reference: &str,
    ) -> IntegrationResult<Value> {
        self.outbound
            .request(
                Method::POST,
                "contacts",
                None,
                Some(payload),
                "erpnext.contact.create",
                external_reference,
            )
            .await
    }

    pub async fn update_contact(
        &self,
        contact_id: &str,
        payload: &Value,
    ) -> IntegrationResult<Value> {
        self.outbound
            .request(
                Method::PUT,
                &format!("contacts/{contact_id}"),
                None,
                Some(payload),
                "erpnext.contact.update",
                contact_id,
            )
            .await
    }

    pub async fn create_invoice(
        &self,
        payload: &Value,
        external_reference: &str,
    ) -> IntegrationResult<Value> {
        self.outbound
            .request(
                Method::POST,
                "invoices",
                None,
                Some(payload),
                "erpnext.invoice.create",
                external_reference,
            )
            .await
    }
}
