//! Store-level tests for the message state machine: transitions, idempotency,
//! payload caps, retry successors.

mod common;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use integration_hub::errors::IntegrationError;
use integration_hub::models::{
    Direction, Integration, MessageStatus, NewMessage, MAX_PAYLOAD_BYTES,
};
use integration_hub::repos::message_repo;

fn inbound(organization_id: Uuid, key: &str) -> NewMessage {
    NewMessage::inbound(
        organization_id,
        Integration::Storefront,
        "orders.paid",
        json!({ "id": 42 }),
    )
    .with_external_reference("42")
    .with_idempotency_key(key)
}

#[tokio::test]
async fn message_walks_the_happy_lifecycle() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = Uuid::new_v4();

    let message = message_repo::create(&pool, inbound(organization_id, "wh-1"))
        .await
        .unwrap();
    assert_eq!(message.status, MessageStatus::Received);
    assert_eq!(message.retries, 0);

    let message = message_repo::mark_dispatched(&pool, message.id, None, Some(202), None)
        .await
        .unwrap();
    assert_eq!(message.status, MessageStatus::Dispatched);
    assert!(message.dispatched_at.is_some());

    let message = message_repo::mark_acknowledged(&pool, message.id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Acknowledged);

    let message = message_repo::mark_processed(
        &pool,
        message.id,
        Some(json!({ "handlers": 1 })),
        Some(202),
        None,
    )
    .await
    .unwrap();
    assert_eq!(message.status, MessageStatus::Processed);
    assert!(message.processed_at.is_some());
    // dispatched_at <= acknowledged_at <= processed_at
    assert!(message.dispatched_at.unwrap() <= message.acknowledged_at.unwrap());
    assert!(message.acknowledged_at.unwrap() <= message.processed_at.unwrap());
}

#[tokio::test]
async fn processed_is_terminal() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = Uuid::new_v4();

    let message = message_repo::create(&pool, inbound(organization_id, "wh-terminal"))
        .await
        .unwrap();
    message_repo::mark_dispatched(&pool, message.id, None, None, None)
        .await
        .unwrap();
    message_repo::mark_processed(&pool, message.id, None, None, None)
        .await
        .unwrap();

    let err = message_repo::mark_acknowledged(&pool, message.id).await.unwrap_err();
    assert!(matches!(err, IntegrationError::InvalidTransition { .. }));

    let reread = message_repo::get(&pool, message.id).await.unwrap().unwrap();
    assert_eq!(reread.status, MessageStatus::Processed);
}

#[tokio::test]
async fn failed_has_no_in_place_transition() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = Uuid::new_v4();

    let message = message_repo::create(&pool, inbound(organization_id, "wh-failed"))
        .await
        .unwrap();
    message_repo::mark_failed(&pool, message.id, "validation_error", "bad", None, false)
        .await
        .unwrap();

    // mark_dispatched skips terminal rows rather than erroring.
    let untouched = message_repo::mark_dispatched(&pool, message.id, None, None, None)
        .await
        .unwrap();
    assert_eq!(untouched.status, MessageStatus::Failed);

    let err = message_repo::mark_processed(&pool, message.id, None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, IntegrationError::InvalidTransition { .. }));
}

#[tokio::test]
async fn duplicate_idempotency_key_is_rejected_at_create() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = Uuid::new_v4();

    let first = message_repo::create(&pool, inbound(organization_id, "wh-dup"))
        .await
        .unwrap();
    let err = message_repo::create(&pool, inbound(organization_id, "wh-dup"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        IntegrationError::DuplicateIdempotencyKey { .. }
    ));

    let found = message_repo::find_by_idempotency_key(
        &pool,
        organization_id,
        Integration::Storefront,
        Direction::Inbound,
        "wh-dup",
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(found.id, first.id);

    // Same key on another tenant is a different message.
    message_repo::create(&pool, inbound(Uuid::new_v4(), "wh-dup"))
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_duplicate_creates_admit_exactly_one_row() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = Uuid::new_v4();

    let (first, second) = tokio::join!(
        message_repo::create(&pool, inbound(organization_id, "wh-race")),
        message_repo::create(&pool, inbound(organization_id, "wh-race")),
    );

    let winners = [&first, &second]
        .iter()
        .filter(|result| result.is_ok())
        .count();
    assert_eq!(winners, 1, "exactly one concurrent create may win");
    let loser = if first.is_err() { first } else { second };
    assert!(matches!(
        loser.unwrap_err(),
        IntegrationError::DuplicateIdempotencyKey { .. }
    ));

    let rows = message_repo::list_for_organization(
        &pool,
        organization_id,
        Some(Integration::Storefront),
        None,
        None,
        100,
    )
    .await
    .unwrap();
    assert_eq!(rows.len(), 1, "the losing insert must not leave a row");
}

#[tokio::test]
async fn outbound_rows_may_share_a_correlation_key() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = Uuid::new_v4();

    let outbound = |event_type: &str| {
        NewMessage::outbound(
            organization_id,
            Integration::Accounting,
            event_type,
            json!({ "body": {} }),
        )
        .with_external_reference("CUST-1")
        .with_idempotency_key("CUST-1")
    };

    message_repo::create(&pool, outbound("erpnext.contact.lookup"))
        .await
        .unwrap();
    message_repo::create(&pool, outbound("erpnext.contact.create"))
        .await
        .unwrap();
}

#[tokio::test]
async fn empty_idempotency_keys_do_not_collide() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = Uuid::new_v4();

    message_repo::create(&pool, inbound(organization_id, ""))
        .await
        .unwrap();
    message_repo::create(&pool, inbound(organization_id, ""))
        .await
        .unwrap();
}

#[tokio::test]
async fn payload_cap_is_enforced_at_create() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = Uuid::new_v4();

    // `{"k":"..."}` serializes to exactly MAX_PAYLOAD_BYTES.
    let at_limit = json!({ "k": "a".repeat(MAX_PAYLOAD_BYTES - 8) });
    let new = NewMessage::inbound(organization_id, Integration::Storefront, "orders.paid", at_limit);
    message_repo::create(&pool, new).await.unwrap();

    let over_limit = json!({ "k": "a".repeat(MAX_PAYLOAD_BYTES - 7) });
    let new = NewMessage::inbound(organization_id, Integration::Storefront, "orders.paid", over_limit);
    let err = message_repo::create(&pool, new).await.unwrap_err();
    assert!(matches!(err, IntegrationError::PayloadTooLarge { .. }));
}

#[tokio::test]
async fn retry_successor_copies_identity_and_schedule() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = Uuid::new_v4();

    let message = message_repo::create(&pool, inbound(organization_id, "wh-retry"))
        .await
        .unwrap();
    let failed = message_repo::mark_failed(&pool, message.id, "server_error", "503", Some(503), true)
        .await
        .unwrap();
    assert_eq!(failed.retries, 1);
    assert!(failed.next_attempt_at.is_some());

    let before = Utc::now();
    let successor = message_repo::schedule_retry(&pool, &failed, None).await.unwrap();
    assert_ne!(successor.id, failed.id);
    assert_eq!(successor.status, MessageStatus::Received);
    assert_eq!(successor.retries, failed.retries);
    assert_eq!(successor.idempotency_key, failed.idempotency_key);
    assert_eq!(successor.payload, failed.payload);
    assert_eq!(successor.error_code, "");

    // delay_seconds(1) = 10
    let next_attempt_at = successor.next_attempt_at.unwrap();
    assert!(next_attempt_at >= before + chrono::Duration::seconds(9));
    assert!(next_attempt_at <= before + chrono::Duration::seconds(15));
}

#[tokio::test]
async fn pending_returns_due_rows_only() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = Uuid::new_v4();

    let due = message_repo::create(&pool, inbound(organization_id, "wh-due"))
        .await
        .unwrap();

    let mut scheduled_new = inbound(organization_id, "wh-scheduled");
    scheduled_new.next_attempt_at = Some(Utc::now() + chrono::Duration::hours(1));
    let scheduled = message_repo::create(&pool, scheduled_new).await.unwrap();

    let pending = message_repo::pending(&pool, Utc::now(), 1000).await.unwrap();
    let ids: Vec<Uuid> = pending.iter().map(|m| m.id).collect();
    assert!(ids.contains(&due.id));
    assert!(!ids.contains(&scheduled.id));
}

#[tokio::test]
async fn retries_never_decrease() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = Uuid::new_v4();

    let message = message_repo::create(&pool, inbound(organization_id, "wh-mono"))
        .await
        .unwrap();
    let failed = message_repo::mark_failed(&pool, message.id, "server_error", "x", None, true)
        .await
        .unwrap();
    assert_eq!(failed.retries, 1);

    let successor = message_repo::schedule_retry(&pool, &failed, Some(0)).await.unwrap();
    let failed_again =
        message_repo::mark_failed(&pool, successor.id, "server_error", "x", None, true)
            .await
            .unwrap();
    assert_eq!(failed_again.retries, 2);
}
