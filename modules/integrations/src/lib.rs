//! Multi-tenant integration hub: webhook ingestion, durable message
//! orchestration with retry/backoff, and connectors for the storefront, ERP,
//! and accounting upstreams.

pub mod clients;
pub mod config;
pub mod db;
pub mod error_codes;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod health;
pub mod models;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod repos;
pub mod routes;
pub mod services;

use event_bus::EventBus;
use sqlx::PgPool;

use crate::queue::QueueHandle;

/// Shared state handed to the HTTP routes.
pub struct AppState {
    pub pool: PgPool,
    pub bus: EventBus,
    pub queue: QueueHandle,
}
