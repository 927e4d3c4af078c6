//! Error taxonomy shared by the store, the outbound clients, and the handlers.
//!
//! The processor is the single place that decides "retry successor vs
//! terminal"; it does so from [`IntegrationError::classify`]. The backorder
//! variant is intentionally separate from the generic fulfillment error: it is
//! checked before the failure branch and never marks the source message failed.

use serde_json::Value;

use crate::error_codes::map_status;

#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    /// No usable credential for the tenant/upstream. Fatal to the message.
    #[error("credential error: {0}")]
    Credential(String),

    /// Structurally invalid payload (missing totals, empty lines, bad types).
    #[error("validation error: {0}")]
    Validation(String),

    /// Payload exceeds the per-message cap.
    #[error("payload too large: {bytes} bytes (max {max})")]
    PayloadTooLarge { bytes: usize, max: usize },

    /// Another row already holds the same (org, integration, direction, key).
    #[error("duplicate idempotency key '{idempotency_key}'")]
    DuplicateIdempotencyKey { idempotency_key: String },

    /// A state change outside the allowed-transitions table. Programming
    /// error: surfaced to logs, never corrupts the row.
    #[error("invalid transition from {from} to {to} for message {message_id}")]
    InvalidTransition {
        message_id: uuid::Uuid,
        from: String,
        to: String,
    },

    /// Classified upstream API failure, mirrored on the outbound message row.
    #[error("{message}")]
    Api {
        message: String,
        status_code: Option<u16>,
        error_code: String,
        retryable: bool,
        body: Value,
    },

    /// Fulfillment pipeline failure with its own code and retry decision.
    #[error("{message}")]
    Fulfillment {
        message: String,
        error_code: String,
        retryable: bool,
        status_code: Option<u16>,
    },

    /// Fulfillment paused waiting for upstream stock. Non-terminal: the
    /// pipeline has already parked its aggregate in `waiting_stock`.
    #[error("waiting for stock: {0}")]
    Backorder(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

/// Classification the processor acts on: `(error_code, retryable, http_status)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub error_code: String,
    pub retryable: bool,
    pub status_code: Option<u16>,
}

impl IntegrationError {
    /// Build a network-class API error (no HTTP status; always retryable).
    pub fn network(message: impl Into<String>) -> Self {
        IntegrationError::Api {
            message: message.into(),
            status_code: None,
            error_code: "network_error".into(),
            retryable: true,
            body: Value::Null,
        }
    }

    /// Fulfillment error helper with an explicit code.
    pub fn fulfillment(error_code: &str, message: impl Into<String>) -> Self {
        IntegrationError::Fulfillment {
            message: message.into(),
            error_code: error_code.to_string(),
            retryable: false,
            status_code: None,
        }
    }

    /// Missing or invalid gateway configuration.
    pub fn configuration(message: impl Into<String>) -> Self {
        IntegrationError::Fulfillment {
            message: message.into(),
            error_code: "configuration_error".into(),
            retryable: false,
            status_code: Some(400),
        }
    }

    pub fn is_backorder(&self) -> bool {
        matches!(self, IntegrationError::Backorder(_))
    }

    /// Variant name for diagnostics and failure summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            IntegrationError::Credential(_) => "Credential",
            IntegrationError::Validation(_) => "Validation",
            IntegrationError::PayloadTooLarge { .. } => "PayloadTooLarge",
            IntegrationError::DuplicateIdempotencyKey { .. } => "DuplicateIdempotencyKey",
            IntegrationError::InvalidTransition { .. } => "InvalidTransition",
            IntegrationError::Api { .. } => "Api",
            IntegrationError::Fulfillment { .. } => "Fulfillment",
            IntegrationError::Backorder(_) => "Backorder",
            IntegrationError::Database(_) => "Database",
            IntegrationError::Unexpected(_) => "Unexpected",
        }
    }

    pub fn classify(&self) -> Classified {
        match self {
            IntegrationError::Api {
                status_code,
                error_code,
                retryable,
                ..
            } => {
                let code = if error_code.is_empty() {
                    map_status(*status_code).0.to_string()
                } else {
                    error_code.clone()
                };
                Classified {
                    error_code: code,
                    retryable: *retryable,
                    status_code: *status_code,
                }
            }
            IntegrationError::Credential(_) => Classified {
                error_code: "credential_error".into(),
                retryable: false,
                status_code: None,
            },
            IntegrationError::Fulfillment {
                error_code,
                retryable,
                status_code,
                ..
            } => Classified {
                error_code: error_code.clone(),
                retryable: *retryable,
                status_code: *status_code,
            },
            IntegrationError::Backorder(_) => Classified {
                error_code: "waiting_stock".into(),
                retryable: true,
                status_code: Some(409),
            },
            IntegrationError::Validation(_) | IntegrationError::PayloadTooLarge { .. } => {
                Classified {
                    error_code: "validation_error".into(),
                    retryable: false,
                    status_code: None,
                }
            }
            IntegrationError::DuplicateIdempotencyKey { .. } => Classified {
                error_code: "conflict_error".into(),
                retryable: false,
                status_code: Some(409),
            },
            IntegrationError::InvalidTransition { .. }
            | IntegrationError::Database(_)
            | IntegrationError::Unexpected(_) => Classified {
                error_code: "unexpected_error".into(),
                retryable: false,
                status_code: None,
            },
        }
    }
}

pub type IntegrationResult<T> = Result<T, IntegrationError>;
