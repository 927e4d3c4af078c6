//! Boundary tests for the webhook ingress routes.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine;
use event_bus::EventBus;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;

use integration_hub::models::{Integration, MessageStatus};
use integration_hub::repos::message_repo;
use integration_hub::{queue, routes, AppState};

fn app_state(pool: &PgPool) -> (Arc<AppState>, queue::QueueReceiver) {
    let (queue_handle, receiver) = queue::queue();
    (
        Arc::new(AppState {
            pool: pool.clone(),
            bus: EventBus::new(),
            queue: queue_handle,
        }),
        receiver,
    )
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

async fn response_json(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn storefront_request(
    organization_id: Uuid,
    shop_domain: &str,
    body: &str,
    signature: &str,
    webhook_id: &str,
) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/webhooks/storefront/{organization_id}"))
        .header("content-type", "application/json")
        .header("X-Shop-Domain", shop_domain)
        .header("X-HMAC-SHA256", signature)
        .header("X-Topic", "orders/paid")
        .header("X-Webhook-Id", webhook_id)
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn storefront_webhook_records_and_accepts() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = common::setup_organization(&pool, json!({})).await;
    let domain = format!("{organization_id}.example-shop.com");
    common::setup_storefront_store(&pool, organization_id, &domain, "shop-secret").await;
    let (state, _rx) = app_state(&pool);

    let body = r##"{"id": 77, "name": "#1001", "total_price": "10.0"}"##;
    let signature = sign("shop-secret", body.as_bytes());

    let response = routes::router(state)
        .oneshot(storefront_request(
            organization_id,
            &domain,
            body,
            &signature,
            "wh-777",
        ))
        .await
        .unwrap();
    let (status, body) = response_json(response).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], json!("accepted"));
    let message_id: Uuid = body["message_id"].as_str().unwrap().parse().unwrap();

    let message = message_repo::get(&pool, message_id).await.unwrap().unwrap();
    assert_eq!(message.integration, Integration::Storefront);
    assert_eq!(message.status, MessageStatus::Dispatched);
    assert_eq!(message.event_type, "orders.paid");
    assert_eq!(message.external_reference, "77");
    assert_eq!(message.idempotency_key, "wh-777");
    assert_eq!(
        message.payload.get("_shop_domain").and_then(Value::as_str),
        Some(domain.as_str())
    );
}

#[tokio::test]
async fn duplicate_storefront_webhook_collapses_to_one_row() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = common::setup_organization(&pool, json!({})).await;
    let domain = format!("{organization_id}.example-shop.com");
    common::setup_storefront_store(&pool, organization_id, &domain, "shop-secret").await;
    let (state, _rx) = app_state(&pool);

    let body = r#"{"id": 88}"#;
    let signature = sign("shop-secret", body.as_bytes());

    let first = routes::router(state.clone())
        .oneshot(storefront_request(
            organization_id,
            &domain,
            body,
            &signature,
            "wh-dup-1",
        ))
        .await
        .unwrap();
    let (first_status, first_body) = response_json(first).await;
    assert_eq!(first_status, StatusCode::ACCEPTED);

    let second = routes::router(state)
        .oneshot(storefront_request(
            organization_id,
            &domain,
            body,
            &signature,
            "wh-dup-1",
        ))
        .await
        .unwrap();
    let (second_status, second_body) = response_json(second).await;
    assert_eq!(second_status, StatusCode::ACCEPTED);
    assert_eq!(first_body["message_id"], second_body["message_id"]);

    let messages = message_repo::list_for_organization(
        &pool,
        organization_id,
        Some(Integration::Storefront),
        None,
        None,
        100,
    )
    .await
    .unwrap();
    assert_eq!(messages.len(), 1, "second delivery must not create a row");
}

#[tokio::test]
async fn storefront_webhook_rejects_bad_signature_without_recording() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = common::setup_organization(&pool, json!({})).await;
    let domain = format!("{organization_id}.example-shop.com");
    common::setup_storefront_store(&pool, organization_id, &domain, "shop-secret").await;
    let (state, _rx) = app_state(&pool);

    let body = r#"{"id": 99}"#;
    let signature = sign("wrong-secret", body.as_bytes());

    let response = routes::router(state)
        .oneshot(storefront_request(
            organization_id,
            &domain,
            body,
            &signature,
            "wh-bad",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let messages = message_repo::list_for_organization(
        &pool,
        organization_id,
        Some(Integration::Storefront),
        None,
        None,
        100,
    )
    .await
    .unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn storefront_webhook_requires_shop_domain() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = common::setup_organization(&pool, json!({})).await;
    let (state, _rx) = app_state(&pool);

    let request = Request::builder()
        .method("POST")
        .uri(format!("/webhooks/storefront/{organization_id}"))
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let response = routes::router(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn accounting_webhook_validates_shared_secret() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = common::setup_organization(&pool, json!({})).await;
    common::setup_accounting_credential(
        &pool,
        organization_id,
        "https://accounting.example.com/api/v1",
        json!({}),
    )
    .await;
    let (state, _rx) = app_state(&pool);

    let payload = json!({ "event": "invoice.created", "id": 555 });

    let rejected = routes::router(state.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/webhooks/accounting/{organization_id}"))
                .header("content-type", "application/json")
                .header("X-Accounting-Webhook-Secret", "wrong")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::FORBIDDEN);

    let accepted = routes::router(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/webhooks/accounting/{organization_id}"))
                .header("content-type", "application/json")
                .header("X-Accounting-Webhook-Secret", "hook-secret")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let (status, body) = response_json(accepted).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let message_id: Uuid = body["message_id"].as_str().unwrap().parse().unwrap();
    let message = message_repo::get(&pool, message_id).await.unwrap().unwrap();
    assert_eq!(message.integration, Integration::Accounting);
    assert_eq!(message.event_type, "invoice.created");
    assert_eq!(message.external_reference, "555");
}

#[tokio::test]
async fn erp_webhook_derives_the_event_type() {
    let Some(pool) = common::try_pool().await else {
        return;
    };
    let organization_id = common::setup_organization(&pool, json!({})).await;
    let (state, _rx) = app_state(&pool);

    let payload = json!({
        "doctype": "POS Invoice",
        "event": "on_submit",
        "name": "POS-000321",
        "grand_total": 1000,
        "items": []
    });

    let response = routes::router(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/webhooks/erp/{organization_id}"))
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let (status, body) = response_json(response).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let message_id: Uuid = body["message_id"].as_str().unwrap().parse().unwrap();
    let message = message_repo::get(&pool, message_id).await.unwrap().unwrap();
    assert_eq!(message.integration, Integration::ErpPos);
    assert_eq!(message.event_type, "pos_invoice.on_submit");
    assert_eq!(message.external_reference, "POS-000321");
    assert_eq!(message.status, MessageStatus::Dispatched);
}
