//! Lookup of static source→target item mappings.

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::{IntegrationError, IntegrationResult};
use crate::models::{FulfillmentItemMap, Integration};

#[derive(sqlx::FromRow)]
struct ItemMapRow {
    id: Uuid,
    organization_id: Uuid,
    source: String,
    source_company: String,
    source_item_code: String,
    target_company: String,
    target_item_code: String,
    warehouse: String,
    metadata: Value,
    is_active: bool,
}

impl ItemMapRow {
    fn into_map(self) -> IntegrationResult<FulfillmentItemMap> {
        let source = Integration::parse(&self.source).ok_or_else(|| {
            IntegrationError::Unexpected(format!("unknown item map source '{}'", self.source))
        })?;
        Ok(FulfillmentItemMap {
            id: self.id,
            organization_id: self.organization_id,
            source,
            source_company: self.source_company,
            source_item_code: self.source_item_code,
            target_company: self.target_company,
            target_item_code: self.target_item_code,
            warehouse: self.warehouse,
            metadata: self.metadata,
            is_active: self.is_active,
        })
    }
}

/// Active mappings for one seller company under a source system.
pub async fn for_source(
    pool: &PgPool,
    organization_id: Uuid,
    source: Integration,
    source_company: &str,
) -> IntegrationResult<Vec<FulfillmentItemMap>> {
    let rows = sqlx::query_as::<_, ItemMapRow>(
        r#"
        SELECT id, organization_id, source, source_company, source_item_code,
               target_company, target_item_code, warehouse, metadata, is_active
        FROM fulfillment_item_maps
        WHERE organization_id = $1 AND source = $2 AND source_company = $3
          AND is_active = TRUE
        ORDER BY source_item_code
        "#,
    )
    .bind(organization_id)
    .bind(source.as_str())
    .bind(source_company)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(ItemMapRow::into_map).collect()
}
