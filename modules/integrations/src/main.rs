use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use event_bus::EventBus;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use integration_hub::config::Config;
use integration_hub::handlers::register_all;
use integration_hub::processor::ProcessorContext;
use integration_hub::{db, queue, routes, AppState};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting integration hub...");

    let config = Config::from_env().expect("Failed to load configuration from environment");

    tracing::info!(
        host = %config.host,
        port = config.port,
        workers = config.worker_count,
        "Configuration loaded"
    );

    tracing::info!("Connecting to database...");
    let pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running migrations...");
    sqlx::migrate!("./db/migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let bus = EventBus::new();
    let registry = Arc::new(register_all(pool.clone(), &bus));

    let (queue_handle, queue_receiver) = queue::queue();
    let ctx = Arc::new(ProcessorContext {
        pool: pool.clone(),
        bus: bus.clone(),
        registry,
        queue: queue_handle.clone(),
    });

    queue::start_workers(ctx.clone(), queue_receiver, config.worker_count);
    queue::start_pending_sweep(ctx.clone(), Duration::from_secs(config.pending_sweep_interval_s));
    queue::start_backorder_sweep(
        ctx.clone(),
        Duration::from_secs(config.backorder_sweep_interval_s),
    );

    let state = Arc::new(AppState {
        pool,
        bus,
        queue: queue_handle,
    });

    let app = routes::router(state).layer(
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Integration hub listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}
