//! Tenant lookup.

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::IntegrationResult;
use crate::models::Organization;

pub async fn get(pool: &PgPool, id: Uuid) -> IntegrationResult<Option<Organization>> {
    let row = sqlx::query_as::<_, (Uuid, String, Value)>(
        "SELECT id, name, metadata FROM organizations WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(id, name, metadata)| Organization { id, name, metadata }))
}
