//! Worker pool and scheduling for the message processor.
//!
//! Message ids travel over an in-process channel; durability comes from the
//! rows themselves (`status = received` + `next_attempt_at`), which the
//! pending sweep re-enqueues after restarts or missed delayed sends. The
//! backorder sweep re-drives fulfillment orders whose stock-wait has elapsed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::Instrument;
use uuid::Uuid;

use crate::processor::{self, ProcessorContext};
use crate::repos::{fulfillment_repo, message_repo};

/// Sending half of the processor queue. Cheap to clone; held by the ingress,
/// the processor (for retry successors), and the sweeps.
#[derive(Clone)]
pub struct QueueHandle {
    sender: mpsc::UnboundedSender<Uuid>,
}

impl QueueHandle {
    pub fn enqueue(&self, message_id: Uuid) {
        if self.sender.send(message_id).is_err() {
            tracing::error!(message_id = %message_id, "processor queue is closed, message not enqueued");
        }
    }

    /// Deliver the id after `delay`. The durable schedule lives on the row;
    /// this is only the in-process wake-up.
    pub fn enqueue_after(&self, delay: Duration, message_id: Uuid) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(message_id).is_err() {
                tracing::error!(message_id = %message_id, "processor queue is closed, delayed message dropped");
            }
        });
    }
}

/// Receiving half, consumed by [`start_workers`].
pub struct QueueReceiver {
    receiver: mpsc::UnboundedReceiver<Uuid>,
}

/// Create the processor queue pair.
pub fn queue() -> (QueueHandle, QueueReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (QueueHandle { sender }, QueueReceiver { receiver })
}

/// Spawn `worker_count` tasks draining the queue. Each worker processes one
/// message at a time; ordering between messages is not promised.
pub fn start_workers(ctx: Arc<ProcessorContext>, receiver: QueueReceiver, worker_count: usize) {
    let receiver = Arc::new(Mutex::new(receiver.receiver));
    for worker in 0..worker_count.max(1) {
        let ctx = ctx.clone();
        let receiver = receiver.clone();
        tokio::spawn(async move {
            tracing::info!(worker, "message worker started");
            loop {
                let message_id = {
                    let mut receiver = receiver.lock().await;
                    receiver.recv().await
                };
                let Some(message_id) = message_id else {
                    break;
                };

                let span = tracing::info_span!("process_message", worker, message_id = %message_id);
                async {
                    if let Err(e) = processor::process_message(&ctx, message_id).await {
                        tracing::error!(error = %e, "message processing failed");
                    }
                }
                .instrument(span)
                .await;
            }
            tracing::warn!(worker, "message worker stopped");
        });
    }
}

/// Periodically re-enqueue `received` messages whose schedule is due. This is
/// what makes delayed retries survive process restarts.
pub fn start_pending_sweep(ctx: Arc<ProcessorContext>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match message_repo::pending(&ctx.pool, Utc::now(), 100).await {
                Ok(messages) => {
                    if !messages.is_empty() {
                        tracing::info!(count = messages.len(), "re-enqueueing pending messages");
                    }
                    for message in messages {
                        ctx.queue.enqueue(message.id);
                    }
                }
                Err(e) => tracing::error!(error = %e, "pending sweep query failed"),
            }
        }
    });
}

/// Periodically re-drive backordered fulfillment orders by re-enqueueing the
/// message that produced them. No successor rows are created for backorders;
/// the source message is processed again and the pipeline re-checks stock.
pub fn start_backorder_sweep(ctx: Arc<ProcessorContext>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match fulfillment_repo::needing_retry(&ctx.pool, Utc::now(), 50).await {
                Ok(orders) => {
                    for order in orders {
                        let Some(message_id) = order.source_message_id else {
                            tracing::warn!(
                                order_id = %order.order_id,
                                "backordered order has no source message, cannot re-drive"
                            );
                            continue;
                        };
                        tracing::info!(
                            order_id = %order.order_id,
                            message_id = %message_id,
                            attempts = order.backorder_attempts,
                            "re-driving backordered order"
                        );
                        // Push the schedule forward so this tick's enqueue is
                        // not repeated before the pipeline runs again.
                        if let Err(e) =
                            fulfillment_repo::defer_backorder(&ctx.pool, order.id, 900).await
                        {
                            tracing::error!(error = %e, "failed to defer backorder schedule");
                        }
                        ctx.queue.enqueue(message_id);
                    }
                }
                Err(e) => tracing::error!(error = %e, "backorder sweep query failed"),
            }
        }
    });
}
