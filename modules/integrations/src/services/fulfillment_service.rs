//! The fulfillment pipeline: normalize → map → gate on stock → distributor
//! documents → record → propagate.

use serde_json::{json, Value};
use sqlx::PgPool;

use crate::clients::ErpClient;
use crate::errors::{IntegrationError, IntegrationResult};
use crate::models::{
    FulfillmentOrder, FulfillmentStatus, Integration, IntegrationMessage, Organization,
};
use crate::repos::{fulfillment_repo, item_map_repo, organization_repo};
use crate::services::fulfillment_executor::{FulfillmentExecutor, FulfillmentResult};
use crate::services::gateway_settings::GatewaySettings;
use crate::services::line_mapper;
use crate::services::order_normalizer::{self, NormalizedOrder};

/// Drive one message through the fulfillment pipeline.
///
/// Already-fulfilled orders short-circuit idempotently with the recorded
/// document identifiers. A stock shortfall parks the aggregate in
/// `waiting_stock` and surfaces as a backorder, which the processor treats as
/// non-terminal for the source message.
pub async fn process_fulfillment_message(
    pool: &PgPool,
    message: &IntegrationMessage,
) -> IntegrationResult<Value> {
    let source = resolve_source(message)?;
    let organization = load_organization(pool, message).await?;
    let settings = GatewaySettings::from_metadata(&organization.metadata)?;

    let distributor_company = settings.distributor_company();
    if distributor_company.is_empty() {
        return Err(IntegrationError::configuration(
            "fulfillment_gateway.distributor_company is required",
        ));
    }

    let payload = &message.payload;
    let seller_company = settings.resolve_seller_company(source, payload);
    let order_id = resolve_order_id(message, payload);

    let order = fulfillment_repo::get_or_create(
        pool,
        message.organization_id,
        source,
        &order_id,
        &seller_company,
        &distributor_company,
        payload,
        message.id,
    )
    .await?;

    if order.status == FulfillmentStatus::Fulfilled {
        tracing::info!(
            order_id = %order.order_id,
            delivery_note = %order.delivery_note_name,
            "order already fulfilled, returning recorded documents"
        );
        return Ok(json!({
            "delivery_note": order.delivery_note_name,
            "sales_order": order.sales_order_name,
            "serials": order.serial_numbers,
            "status": "already_fulfilled",
        }));
    }

    fulfillment_repo::mark_status(pool, order.id, FulfillmentStatus::Processing, "", "", None)
        .await?;

    match run_pipeline(pool, &order, &settings, source, payload).await {
        Ok(result) => Ok(result),
        Err(err) if err.is_backorder() => {
            tracing::info!(
                order_id = %order.order_id,
                error = %err,
                "order waiting for stock"
            );
            fulfillment_repo::mark_waiting_stock(
                pool,
                order.id,
                &err.to_string(),
                settings.backorder_retry_seconds(),
            )
            .await?;
            Err(err)
        }
        Err(IntegrationError::Fulfillment {
            message: error_message,
            error_code,
            retryable,
            status_code,
        }) => {
            tracing::error!(
                order_id = %order.order_id,
                error_code = %error_code,
                error = %error_message,
                "fulfillment pipeline failed"
            );
            fulfillment_repo::mark_status(
                pool,
                order.id,
                FulfillmentStatus::Failed,
                &error_code,
                &error_message,
                None,
            )
            .await?;
            Err(IntegrationError::Fulfillment {
                message: error_message,
                error_code,
                retryable,
                status_code,
            })
        }
        Err(IntegrationError::Api { message: error_message, .. }) => {
            // Upstream client failures are retryable infrastructure errors
            // from the pipeline's point of view.
            tracing::error!(
                order_id = %order.order_id,
                error = %error_message,
                "distributor API error during fulfillment"
            );
            fulfillment_repo::mark_status(
                pool,
                order.id,
                FulfillmentStatus::Failed,
                "erpnext_error",
                &error_message,
                None,
            )
            .await?;
            Err(IntegrationError::Fulfillment {
                message: error_message,
                error_code: "erpnext_error".into(),
                retryable: true,
                status_code: Some(502),
            })
        }
        Err(err) => {
            tracing::error!(
                order_id = %order.order_id,
                error = %err,
                "unexpected error during fulfillment"
            );
            fulfillment_repo::mark_status(
                pool,
                order.id,
                FulfillmentStatus::Failed,
                "unexpected_error",
                &err.to_string(),
                None,
            )
            .await?;
            Err(err)
        }
    }
}

async fn run_pipeline(
    pool: &PgPool,
    order: &FulfillmentOrder,
    settings: &GatewaySettings,
    source: Integration,
    payload: &Value,
) -> IntegrationResult<Value> {
    let normalized = order_normalizer::normalize(
        source,
        payload,
        &order.seller_company,
        &order.distributor_company,
    )?;
    fulfillment_repo::save_normalized_order(pool, order.id, &normalized.summary()).await?;

    let item_maps = item_map_repo::for_source(
        pool,
        order.organization_id,
        source,
        &normalized.seller_company,
    )
    .await?;
    let (mut mapped_lines, snapshot) = line_mapper::map_lines(&normalized, &item_maps, settings)?;
    fulfillment_repo::save_mapping_snapshot(pool, order.id, &snapshot).await?;

    let distributor_client = distributor_client(pool, order).await?;
    let executor = FulfillmentExecutor::new(&distributor_client, settings);

    executor
        .ensure_availability(&mut mapped_lines, &normalized.order_id)
        .await?;

    let sales_order_name = executor
        .create_sales_order(&normalized, &mapped_lines)
        .await?;
    let result = executor
        .create_delivery_note(&normalized, &mapped_lines, sales_order_name.as_deref())
        .await?;

    fulfillment_repo::record_fulfillment(
        pool,
        order.id,
        &result.delivery_note,
        result.sales_order.as_deref(),
        &result.serials,
        &json!({
            "delivery_note": result.delivery_note,
            "sales_order": result.sales_order,
            "serials": result.serials,
            "line_serials": result.line_serials,
        }),
    )
    .await?;

    propagate_status(pool, order, &normalized, &result).await;

    Ok(json!({
        "delivery_note": result.delivery_note,
        "sales_order": result.sales_order,
        "serials": result.serials,
        "line_serials": result.line_serials,
    }))
}

async fn distributor_client(
    pool: &PgPool,
    order: &FulfillmentOrder,
) -> IntegrationResult<ErpClient> {
    ErpClient::for_company(pool, order.organization_id, Some(&order.distributor_company))
        .await
        .map_err(|_| {
            IntegrationError::configuration(format!(
                "no active ERP credential for distributor company {}",
                order.distributor_company
            ))
        })
}

/// Best-effort status propagation back to the source system. Failures are
/// logged and swallowed; the fulfillment itself is already recorded.
async fn propagate_status(
    pool: &PgPool,
    order: &FulfillmentOrder,
    normalized: &NormalizedOrder,
    result: &FulfillmentResult,
) {
    match normalized.source {
        Integration::ErpPos => {
            let client = match ErpClient::for_company(
                pool,
                order.organization_id,
                Some(&normalized.seller_company),
            )
            .await
            {
                Ok(client) => client,
                Err(err) => {
                    tracing::warn!(
                        seller_company = %normalized.seller_company,
                        error = %err,
                        "no ERP credential for the seller, skipping status propagation"
                    );
                    return;
                }
            };
            let patch = json!({
                "custom_fulfillment_status": "fulfilled",
                "custom_external_ref": result.delivery_note,
            });
            if let Err(err) = client
                .update_doc("Sales Invoice", &normalized.order_id, &patch)
                .await
            {
                tracing::warn!(
                    order_id = %normalized.order_id,
                    error = %err,
                    "failed to propagate fulfillment status to the source invoice"
                );
            }
        }
        Integration::Storefront => {
            let feedback = json!({
                "status": "pending",
                "delivery_note": result.delivery_note,
                "note": "storefront fulfillment notification not configured",
            });
            if let Err(err) = fulfillment_repo::merge_result_payload(
                pool,
                order.id,
                "storefront_feedback",
                &feedback,
            )
            .await
            {
                tracing::warn!(
                    order_id = %order.order_id,
                    error = %err,
                    "failed to record storefront feedback note"
                );
            }
        }
        Integration::Accounting => {}
    }
}

fn resolve_source(message: &IntegrationMessage) -> IntegrationResult<Integration> {
    match message.integration {
        Integration::Storefront => Ok(Integration::Storefront),
        Integration::ErpPos => Ok(Integration::ErpPos),
        Integration::Accounting => Err(IntegrationError::fulfillment(
            "unsupported_source",
            "accounting messages do not enter the fulfillment pipeline",
        )),
    }
}

fn resolve_order_id(message: &IntegrationMessage, payload: &Value) -> String {
    let from_payload = order_normalizer::resolve_order_id(payload);
    if !from_payload.is_empty() {
        return from_payload;
    }
    if !message.external_reference.is_empty() {
        return message.external_reference.clone();
    }
    message.id.to_string()
}

async fn load_organization(
    pool: &PgPool,
    message: &IntegrationMessage,
) -> IntegrationResult<Organization> {
    organization_repo::get(pool, message.organization_id)
        .await?
        .ok_or_else(|| {
            IntegrationError::configuration(format!(
                "organization {} not found",
                message.organization_id
            ))
        })
}
