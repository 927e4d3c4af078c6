//! Outbound call contract shared by the upstream API clients.
//!
//! Every call materializes an outbound message row *before* touching the
//! wire; the wire outcome then mutates that row and never any other. This is
//! what keeps handler retries safe: re-running a handler issues fresh rows
//! instead of rewriting history.

use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error_codes::{extract_error_message, map_status};
use crate::errors::{IntegrationError, IntegrationResult};
use crate::models::{Integration, NewMessage};
use crate::repos::message_repo;

/// Authentication scheme of an upstream API.
#[derive(Debug, Clone)]
pub enum AuthScheme {
    /// `Authorization: Basic base64(username:password)`, used by the accounting upstream.
    Basic { username: String, password: String },
    /// `Authorization: token key:secret`, used by the ERP upstream.
    TokenPair { key: String, secret: String },
}

impl AuthScheme {
    pub fn header_value(&self) -> String {
        match self {
            AuthScheme::Basic { username, password } => {
                let raw = format!("{username}:{password}");
                let encoded = base64::engine::general_purpose::STANDARD.encode(raw.as_bytes());
                format!("Basic {encoded}")
            }
            AuthScheme::TokenPair { key, secret } => format!("token {key}:{secret}"),
        }
    }
}

/// Join base URL and path with exactly one separating slash.
pub fn join_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Idempotency key for an outbound call: the external reference, else the
/// body's `external_reference`, else the body's `id`.
pub fn derive_idempotency_key(external_reference: &str, body: Option<&Value>) -> String {
    if !external_reference.is_empty() {
        return external_reference.to_string();
    }
    let Some(body) = body else {
        return String::new();
    };
    for key in ["external_reference", "id"] {
        match body.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return s.clone(),
            Some(Value::Number(n)) => return n.to_string(),
            _ => {}
        }
    }
    String::new()
}

/// One wire-level client bound to a tenant, an upstream, and a credential.
#[derive(Clone)]
pub struct OutboundClient {
    pool: PgPool,
    organization_id: Uuid,
    integration: Integration,
    base_url: String,
    auth: AuthScheme,
    http: reqwest::Client,
}

impl OutboundClient {
    pub fn new(
        pool: PgPool,
        organization_id: Uuid,
        integration: Integration,
        base_url: impl Into<String>,
        auth: AuthScheme,
        timeout_s: i32,
    ) -> IntegrationResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_s.max(1) as u64))
            .build()
            .map_err(|e| IntegrationError::Unexpected(format!("failed to build client: {e}")))?;
        Ok(Self {
            pool,
            organization_id,
            integration,
            base_url: base_url.into(),
            auth,
            http,
        })
    }

    pub fn organization_id(&self) -> Uuid {
        self.organization_id
    }

    /// Issue a request per the outbound contract and return the parsed body.
    ///
    /// Non-2xx statuses and transport failures are mirrored onto the message
    /// row and surface as classified [`IntegrationError::Api`] values.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        params: Option<&[(String, String)]>,
        body: Option<&Value>,
        event_type: &str,
        external_reference: &str,
    ) -> IntegrationResult<Value> {
        let url = join_url(&self.base_url, path);
        let message = self
            .log_outbound_message(&method, &url, params, body, event_type, external_reference)
            .await?;

        let started_at = Utc::now();
        let mut request = self
            .http
            .request(method, &url)
            .header("Authorization", self.auth.header_value())
            .header("Accept", "application/json");
        if let Some(params) = params {
            request = request.query(params);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(
                    url = %url,
                    message_id = %message.id,
                    error = %e,
                    "network error calling upstream"
                );
                message_repo::mark_failed(
                    &self.pool,
                    message.id,
                    "network_error",
                    &e.to_string(),
                    None,
                    true,
                )
                .await?;
                return Err(IntegrationError::network(format!(
                    "network error calling {url}: {e}"
                )));
            }
        };

        let latency_ms = (Utc::now() - started_at).num_milliseconds().max(0) as i32;
        let status = response.status();
        message_repo::mark_dispatched(
            &self.pool,
            message.id,
            Some(started_at),
            Some(status.as_u16() as i32),
            Some(latency_ms),
        )
        .await?;

        let parsed = parse_response_body(response.bytes().await.ok().as_deref());

        if status.is_success() {
            message_repo::mark_processed(
                &self.pool,
                message.id,
                Some(parsed.clone()),
                Some(status.as_u16() as i32),
                Some(latency_ms),
            )
            .await?;
            return Ok(parsed);
        }

        let (error_code, retryable) = map_status(Some(status.as_u16()));
        let error_message = extract_error_message(&parsed);
        message_repo::mark_failed(
            &self.pool,
            message.id,
            error_code,
            &error_message,
            Some(status.as_u16() as i32),
            retryable,
        )
        .await?;

        Err(IntegrationError::Api {
            message: format!("upstream responded {}: {error_message}", status.as_u16()),
            status_code: Some(status.as_u16()),
            error_code: error_code.to_string(),
            retryable,
            body: parsed,
        })
    }

    async fn log_outbound_message(
        &self,
        method: &Method,
        url: &str,
        params: Option<&[(String, String)]>,
        body: Option<&Value>,
        event_type: &str,
        external_reference: &str,
    ) -> IntegrationResult<crate::models::IntegrationMessage> {
        let mut external_reference = external_reference.to_string();
        if external_reference.is_empty() {
            if let Some(Value::String(s)) = body.and_then(|b| b.get("external_reference")) {
                external_reference = s.clone();
            }
        }
        let idempotency_key = derive_idempotency_key(&external_reference, body);

        let request_payload = json!({
            "method": method.as_str(),
            "url": url,
            "params": params
                .map(|p| Value::Object(
                    p.iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect(),
                ))
                .unwrap_or_else(|| json!({})),
            "body": body.cloned().unwrap_or_else(|| json!({})),
        });

        let event_type = if event_type.is_empty() {
            method.as_str().to_string()
        } else {
            event_type.to_string()
        };

        message_repo::create(
            &self.pool,
            NewMessage::outbound(
                self.organization_id,
                self.integration,
                event_type,
                request_payload,
            )
            .with_external_reference(external_reference)
            .with_idempotency_key(idempotency_key),
        )
        .await
    }
}

fn parse_response_body(bytes: Option<&[u8]>) -> Value {
    let Some(bytes) = bytes else {
        return json!({});
    };
    if bytes.is_empty() {
        return json!({});
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => value,
        Err(_) => json!({ "raw": String::from_utf8_lossy(bytes).to_string() }),
    }
}
