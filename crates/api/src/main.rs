//! Courier API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use courier_common::audit::{AuditStore, NoopAuditStore, PgAuditStore, create_pool};
use courier_common::config::AppConfig;
use courier_common::metrics::InMemoryMetrics;
use courier_notifier::queue::{DelayedQueue, RedisSortedSet};
use courier_notifier::transport::{EmailClient, RetryPolicy, SmtpMailTransport, SmtpSettings};

use courier_api::routes::create_router;
use courier_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("courier_api=debug,courier_notifier=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Courier API server...");

    // Load configuration
    let config = AppConfig::from_env()?;
    let metrics = Arc::new(InMemoryMetrics::new());

    // Audit store, migrated on startup when configured
    let audit: Arc<dyn AuditStore> = match &config.database_url {
        Some(url) => {
            let store = PgAuditStore::new(create_pool(url, config.db_max_connections).await?);
            store.migrate().await?;
            tracing::info!("Database pool created and migrations applied");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, audit records will be discarded");
            Arc::new(NoopAuditStore)
        }
    };

    // Delayed queue on Redis
    let store = RedisSortedSet::connect(&config.redis_url).await?;
    tracing::info!("Redis connection established");
    let queue = Arc::new(DelayedQueue::new(
        Arc::new(store),
        config.queue_key.clone(),
        Some(config.queue_timeout()),
        metrics.clone(),
    ));

    // SMTP client for instant sends
    let transport = SmtpMailTransport::new(&SmtpSettings::from_config(&config))?;
    let client = EmailClient::new(
        config.email_from.clone(),
        Arc::new(transport),
        RetryPolicy::new(config.smtp_max_retries, config.smtp_retry_pause()),
        metrics.clone(),
    );
    client.sender_mailbox()?;

    // Build application state
    let state = AppState::new(queue, Arc::new(client), audit, metrics);
    let shutdown = state.shutdown.clone();

    // Build router
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal, stopping gracefully...");
            }
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
