//! Credential selection for the upstream APIs.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::IntegrationResult;
use crate::models::{AccountingCredential, ErpCredential, StorefrontStore};

#[derive(sqlx::FromRow)]
struct AccountingRow {
    id: Uuid,
    organization_id: Uuid,
    name: String,
    company: String,
    email: String,
    token: String,
    base_url: String,
    webhook_secret: String,
    number_template_id: Option<i32>,
    auto_stamp_on_create: bool,
    timeout_s: i32,
    max_retries: i32,
    metadata: Value,
    is_active: bool,
    valid_from: Option<DateTime<Utc>>,
    valid_until: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl From<AccountingRow> for AccountingCredential {
    fn from(row: AccountingRow) -> Self {
        AccountingCredential {
            id: row.id,
            organization_id: row.organization_id,
            name: row.name,
            company: row.company,
            email: row.email,
            token: row.token,
            base_url: row.base_url,
            webhook_secret: row.webhook_secret,
            number_template_id: row.number_template_id,
            auto_stamp_on_create: row.auto_stamp_on_create,
            timeout_s: row.timeout_s,
            max_retries: row.max_retries,
            metadata: row.metadata,
            is_active: row.is_active,
            valid_from: row.valid_from,
            valid_until: row.valid_until,
            updated_at: row.updated_at,
        }
    }
}

const ACCOUNTING_COLUMNS: &str = r#"
    id, organization_id, name, company, email, token, base_url, webhook_secret,
    number_template_id, auto_stamp_on_create, timeout_s, max_retries, metadata,
    is_active, valid_from, valid_until, updated_at
"#;

/// Most recently updated active accounting credential for a tenant,
/// preferring a case-insensitive company match when one is given.
pub async fn accounting_for_company(
    pool: &PgPool,
    organization_id: Uuid,
    company: Option<&str>,
) -> IntegrationResult<Option<AccountingCredential>> {
    if let Some(company) = company.map(str::trim).filter(|c| !c.is_empty()) {
        let sql = format!(
            r#"
            SELECT {ACCOUNTING_COLUMNS} FROM accounting_credentials
            WHERE organization_id = $1 AND is_active = TRUE AND LOWER(company) = LOWER($2)
            ORDER BY updated_at DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query_as::<_, AccountingRow>(&sql)
            .bind(organization_id)
            .bind(company)
            .fetch_optional(pool)
            .await?;
        if let Some(row) = row {
            return Ok(Some(row.into()));
        }
    }
    accounting_active(pool, organization_id).await
}

/// Most recently updated active accounting credential for a tenant.
pub async fn accounting_active(
    pool: &PgPool,
    organization_id: Uuid,
) -> IntegrationResult<Option<AccountingCredential>> {
    let sql = format!(
        r#"
        SELECT {ACCOUNTING_COLUMNS} FROM accounting_credentials
        WHERE organization_id = $1 AND is_active = TRUE
        ORDER BY updated_at DESC
        LIMIT 1
        "#
    );
    let row = sqlx::query_as::<_, AccountingRow>(&sql)
        .bind(organization_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Into::into))
}

/// Active accounting credential carrying a webhook secret, for ingress
/// validation.
pub async fn accounting_with_webhook_secret(
    pool: &PgPool,
    organization_id: Uuid,
) -> IntegrationResult<Option<AccountingCredential>> {
    let sql = format!(
        r#"
        SELECT {ACCOUNTING_COLUMNS} FROM accounting_credentials
        WHERE organization_id = $1 AND is_active = TRUE AND webhook_secret <> ''
        ORDER BY updated_at DESC
        LIMIT 1
        "#
    );
    let row = sqlx::query_as::<_, AccountingRow>(&sql)
        .bind(organization_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Into::into))
}

#[derive(sqlx::FromRow)]
struct ErpRow {
    id: Uuid,
    organization_id: Uuid,
    company: String,
    base_url: String,
    api_key: String,
    api_secret: String,
    timeout_s: i32,
    metadata: Value,
    is_active: bool,
}

impl From<ErpRow> for ErpCredential {
    fn from(row: ErpRow) -> Self {
        ErpCredential {
            id: row.id,
            organization_id: row.organization_id,
            company: row.company,
            base_url: row.base_url,
            api_key: row.api_key,
            api_secret: row.api_secret,
            timeout_s: row.timeout_s,
            metadata: row.metadata,
            is_active: row.is_active,
        }
    }
}

const ERP_COLUMNS: &str = r#"
    id, organization_id, company, base_url, api_key, api_secret, timeout_s,
    metadata, is_active
"#;

/// Active ERP credential for a company, falling back to the most recently
/// updated active credential for the tenant.
pub async fn erp_for_company(
    pool: &PgPool,
    organization_id: Uuid,
    company: Option<&str>,
) -> IntegrationResult<Option<ErpCredential>> {
    if let Some(company) = company.map(str::trim).filter(|c| !c.is_empty()) {
        let sql = format!(
            r#"
            SELECT {ERP_COLUMNS} FROM erp_credentials
            WHERE organization_id = $1 AND is_active = TRUE AND LOWER(company) = LOWER($2)
            ORDER BY updated_at DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query_as::<_, ErpRow>(&sql)
            .bind(organization_id)
            .bind(company)
            .fetch_optional(pool)
            .await?;
        if let Some(row) = row {
            return Ok(Some(row.into()));
        }
    }

    let sql = format!(
        r#"
        SELECT {ERP_COLUMNS} FROM erp_credentials
        WHERE organization_id = $1 AND is_active = TRUE
        ORDER BY updated_at DESC
        LIMIT 1
        "#
    );
    let row = sqlx::query_as::<_, ErpRow>(&sql)
        .bind(organization_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Into::into))
}

#[derive(sqlx::FromRow)]
struct StoreRow {
    id: Uuid,
    organization_id: Uuid,
    shop_domain: String,
    webhook_shared_secret: String,
    is_active: bool,
}

/// Storefront shop registration by domain, scoped to the tenant on the path.
pub async fn storefront_store(
    pool: &PgPool,
    organization_id: Uuid,
    shop_domain: &str,
) -> IntegrationResult<Option<StorefrontStore>> {
    let row = sqlx::query_as::<_, StoreRow>(
        r#"
        SELECT id, organization_id, shop_domain, webhook_shared_secret, is_active
        FROM storefront_stores
        WHERE organization_id = $1 AND shop_domain = $2 AND is_active = TRUE
        "#,
    )
    .bind(organization_id)
    .bind(shop_domain)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| StorefrontStore {
        id: row.id,
        organization_id: row.organization_id,
        shop_domain: row.shop_domain,
        webhook_shared_secret: row.webhook_shared_secret,
        is_active: row.is_active,
    }))
}
