//! The asynchronous message processor: loads a message, announces it on the
//! bus, routes it through the handler registry, and drives the state machine
//! including retry-successor scheduling.

use std::sync::Arc;
use std::time::Duration;

use event_bus::EventBus;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::{IntegrationError, IntegrationResult};
use crate::events::{InboundMessageEvent, OutboundMessageEvent};
use crate::models::{
    backoff_delay_seconds, Direction, IntegrationMessage, MessageStatus, MAX_AUTO_RETRIES,
};
use crate::queue::QueueHandle;
use crate::registry::HandlerRegistry;
use crate::repos::message_repo;

/// Everything a worker needs to process messages. Built once at startup and
/// shared across the pool.
pub struct ProcessorContext {
    pub pool: PgPool,
    pub bus: EventBus,
    pub registry: Arc<HandlerRegistry>,
    pub queue: QueueHandle,
}

/// Process one message by id.
///
/// Missing rows and rows that already moved past the dispatchable states are
/// skipped silently: workers may legitimately race a duplicate enqueue.
pub async fn process_message(ctx: &ProcessorContext, message_id: Uuid) -> IntegrationResult<()> {
    let Some(message) = message_repo::get(&ctx.pool, message_id).await? else {
        tracing::warn!(message_id = %message_id, "message not found, skipping");
        return Ok(());
    };

    if !matches!(
        message.status,
        MessageStatus::Received | MessageStatus::Dispatched
    ) {
        tracing::debug!(
            message_id = %message_id,
            status = %message.status,
            "message already handled, skipping"
        );
        return Ok(());
    }

    // Successor rows are created in `received`; record the pickup so the rest
    // of the lifecycle stays inside the allowed transitions.
    let message = if message.status == MessageStatus::Received {
        message_repo::mark_dispatched(&ctx.pool, message.id, None, None, None).await?
    } else {
        message
    };

    match message.direction {
        Direction::Inbound => process_inbound(ctx, message).await,
        Direction::Outbound => process_outbound(ctx, message).await,
    }
}

async fn process_inbound(ctx: &ProcessorContext, message: IntegrationMessage) -> IntegrationResult<()> {
    tracing::info!(
        message_id = %message.id,
        integration = %message.integration,
        event_type = %message.event_type,
        retries = message.retries,
        "processing inbound message"
    );

    let outcome = run_handlers(ctx, &message).await;

    match outcome {
        Ok(results) => {
            message_repo::mark_acknowledged(&ctx.pool, message.id).await?;
            message_repo::mark_processed(
                &ctx.pool,
                message.id,
                Some(json!({ "handlers": results.len(), "results": results })),
                Some(202),
                None,
            )
            .await?;
            tracing::info!(message_id = %message.id, "inbound message processed");
            Ok(())
        }
        Err(err) if err.is_backorder() => {
            // The fulfillment pipeline already parked its aggregate in
            // waiting_stock with a schedule; the message row stays as-is and
            // the backorder sweep re-drives it.
            tracing::info!(message_id = %message.id, error = %err, "message waiting for stock");
            Ok(())
        }
        Err(err) => {
            let classified = err.classify();
            tracing::error!(
                message_id = %message.id,
                error_code = %classified.error_code,
                retryable = classified.retryable,
                error = %err,
                "inbound message failed"
            );

            if let Err(ack_err) = message_repo::mark_acknowledged(&ctx.pool, message.id).await {
                tracing::warn!(
                    message_id = %message.id,
                    error = %ack_err,
                    "could not acknowledge failing message"
                );
            }

            let failed = message_repo::mark_failed(
                &ctx.pool,
                message.id,
                &classified.error_code,
                &err.to_string(),
                classified.status_code.map(|s| s as i32),
                classified.retryable,
            )
            .await?;

            let mut summary = json!({
                "status": "failed",
                "error_code": classified.error_code,
                "retryable": classified.retryable,
                "exception": err.kind(),
            });

            if classified.retryable && failed.retries < MAX_AUTO_RETRIES {
                let delay = backoff_delay_seconds(failed.retries);
                let successor =
                    message_repo::schedule_retry(&ctx.pool, &failed, Some(delay)).await?;
                ctx.queue
                    .enqueue_after(Duration::from_secs(delay as u64), successor.id);
                summary["next_attempt_id"] = json!(successor.id);
                if let Some(next_attempt_at) = successor.next_attempt_at {
                    summary["next_attempt_at"] = json!(next_attempt_at.to_rfc3339());
                }
                tracing::info!(
                    message_id = %message.id,
                    successor_id = %successor.id,
                    delay_seconds = delay,
                    "scheduled retry successor"
                );
            }

            message_repo::set_response_payload(&ctx.pool, message.id, summary).await?;
            Ok(())
        }
    }
}

async fn run_handlers(
    ctx: &ProcessorContext,
    message: &IntegrationMessage,
) -> IntegrationResult<Vec<Value>> {
    let event = InboundMessageEvent::from_message(message).into_domain_event();
    let mut results = ctx
        .bus
        .publish(&event)
        .await
        .map_err(|e| IntegrationError::Unexpected(format!("event bus handler failed: {e}")))?;

    let dispatched = ctx
        .registry
        .dispatch(message.integration, &message.event_type, message)
        .await?;
    results.extend(dispatched);
    Ok(results)
}

async fn process_outbound(
    ctx: &ProcessorContext,
    message: IntegrationMessage,
) -> IntegrationResult<()> {
    let event = OutboundMessageEvent::from_message(&message).into_domain_event();
    if let Err(e) = ctx.bus.publish(&event).await {
        tracing::warn!(message_id = %message.id, error = %e, "outbound event handler failed");
    }

    if message.status != MessageStatus::Processed {
        let response = if message.response_payload.is_null() {
            json!({})
        } else {
            message.response_payload.clone()
        };
        message_repo::mark_processed(&ctx.pool, message.id, Some(response), Some(200), None)
            .await?;
    }
    Ok(())
}
