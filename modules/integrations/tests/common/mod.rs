//! Shared utilities for the DB-backed integration tests.
//!
//! Tests run against the database named by `DATABASE_URL` and skip themselves
//! when it is unset or unreachable, so the pure-logic suites stay usable on
//! machines without PostgreSQL. A single small pool is shared per test binary.

#![allow(dead_code)]

use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::OnceCell;
use uuid::Uuid;

static TEST_POOL: OnceCell<Option<PgPool>> = OnceCell::const_new();

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./db/migrations");

/// Get the shared test pool, or `None` when no database is available.
pub async fn try_pool() -> Option<PgPool> {
    TEST_POOL
        .get_or_init(|| async {
            let database_url = std::env::var("DATABASE_URL").ok()?;
            if std::env::var("DB_MAX_CONNECTIONS").is_err() {
                std::env::set_var("DB_MAX_CONNECTIONS", "5");
            }
            if std::env::var("DB_ACQUIRE_TIMEOUT_SECS").is_err() {
                std::env::set_var("DB_ACQUIRE_TIMEOUT_SECS", "10");
            }
            let pool = match integration_hub::db::init_pool(&database_url).await {
                Ok(pool) => pool,
                Err(e) => {
                    eprintln!("skipping DB tests: cannot connect to {database_url}: {e}");
                    return None;
                }
            };
            if let Err(e) = MIGRATOR.run(&pool).await {
                eprintln!("skipping DB tests: migrations failed: {e}");
                return None;
            }
            Some(pool)
        })
        .await
        .clone()
}

/// Create a tenant with the given gateway/accounting metadata.
pub async fn setup_organization(pool: &PgPool, metadata: Value) -> Uuid {
    let organization_id = Uuid::new_v4();
    sqlx::query("INSERT INTO organizations (id, name, metadata) VALUES ($1, $2, $3)")
        .bind(organization_id)
        .bind(format!("test-org-{organization_id}"))
        .bind(metadata)
        .execute(pool)
        .await
        .expect("failed to create test organization");
    organization_id
}

pub async fn setup_accounting_credential(
    pool: &PgPool,
    organization_id: Uuid,
    base_url: &str,
    metadata: Value,
) -> Uuid {
    let credential_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO accounting_credentials
            (id, organization_id, name, email, token, base_url, webhook_secret, metadata)
        VALUES ($1, $2, $3, 'ops@example.com', 'token-123', $4, 'hook-secret', $5)
        "#,
    )
    .bind(credential_id)
    .bind(organization_id)
    .bind(format!("credential-{credential_id}"))
    .bind(base_url)
    .bind(metadata)
    .execute(pool)
    .await
    .expect("failed to create accounting credential");
    credential_id
}

pub async fn setup_erp_credential(
    pool: &PgPool,
    organization_id: Uuid,
    company: &str,
    base_url: &str,
) -> Uuid {
    let credential_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO erp_credentials
            (id, organization_id, company, base_url, api_key, api_secret)
        VALUES ($1, $2, $3, $4, 'key', 'secret')
        "#,
    )
    .bind(credential_id)
    .bind(organization_id)
    .bind(company)
    .bind(base_url)
    .execute(pool)
    .await
    .expect("failed to create ERP credential");
    credential_id
}

pub async fn setup_storefront_store(
    pool: &PgPool,
    organization_id: Uuid,
    shop_domain: &str,
    secret: &str,
) -> Uuid {
    let store_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO storefront_stores
            (id, organization_id, shop_domain, webhook_shared_secret)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(store_id)
    .bind(organization_id)
    .bind(shop_domain)
    .bind(secret)
    .execute(pool)
    .await
    .expect("failed to create storefront store");
    store_id
}

pub async fn setup_item_map(
    pool: &PgPool,
    organization_id: Uuid,
    source: &str,
    source_company: &str,
    source_item_code: &str,
    target_company: &str,
    target_item_code: &str,
    warehouse: &str,
) {
    sqlx::query(
        r#"
        INSERT INTO fulfillment_item_maps
            (id, organization_id, source, source_company, source_item_code,
             target_company, target_item_code, warehouse)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(source)
    .bind(source_company)
    .bind(source_item_code)
    .bind(target_company)
    .bind(target_item_code)
    .bind(warehouse)
    .execute(pool)
    .await
    .expect("failed to create item map");
}
