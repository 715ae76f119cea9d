use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use courier_common::audit::{AuditStore, NoopAuditStore, PgAuditStore, create_pool};
use courier_common::config::AppConfig;
use courier_common::metrics::InMemoryMetrics;
use courier_notifier::queue::{DelayedQueue, RedisSortedSet};
use courier_notifier::transport::{EmailClient, RetryPolicy, SmtpMailTransport, SmtpSettings};
use courier_notifier::worker::DispatchWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_notifier=info,courier_worker=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier dispatch worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;
    let metrics = Arc::new(InMemoryMetrics::new());

    // Delayed queue on Redis
    let store = RedisSortedSet::connect(&config.redis_url).await?;
    let queue = Arc::new(DelayedQueue::new(
        Arc::new(store),
        config.queue_key.clone(),
        Some(config.queue_timeout()),
        metrics.clone(),
    ));

    // SMTP transport client
    let transport = SmtpMailTransport::new(&SmtpSettings::from_config(&config))?;
    let client = EmailClient::new(
        config.email_from.clone(),
        Arc::new(transport),
        RetryPolicy::new(config.smtp_max_retries, config.smtp_retry_pause()),
        metrics.clone(),
    );
    // Refuse to start with a sender every send would reject
    client.sender_mailbox()?;

    // Audit store (optional), migrated on startup so the worker can run first
    let audit: Arc<dyn AuditStore> = match &config.database_url {
        Some(url) => {
            let store = PgAuditStore::new(create_pool(url, config.db_max_connections).await?);
            store.migrate().await?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, audit records will be discarded");
            Arc::new(NoopAuditStore)
        }
    };

    let worker = DispatchWorker::new(
        queue,
        Arc::new(client),
        audit,
        metrics.clone(),
        config.worker_tick_interval(),
    );

    // Cancel on Ctrl+C; the worker drains in-flight batches before returning
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received shutdown signal, stopping gracefully...");
                shutdown.cancel();
            }
        }
    });

    let result = worker.run(shutdown).await;

    for (op, stats) in metrics.snapshot() {
        tracing::info!(
            op,
            success = stats.success,
            error = stats.error,
            canceled = stats.canceled,
            timeout = stats.timeout,
            "Operation totals"
        );
    }

    if let Err(e) = result {
        tracing::error!(error = %e, "Dispatch worker exited with error");
        return Err(e.into());
    }

    tracing::info!("Courier dispatch worker stopped.");
    Ok(())
}
