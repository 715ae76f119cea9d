//! Audit store — durable record of every notification the system accepted.
//!
//! The delivery core only hands finalized records over; the schema lives in
//! `migrations/0001_notifications.sql`.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::Mutex;

use crate::types::AuditRecord;

/// Record-keeping collaborator called after a send or enqueue completes.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<(), sqlx::Error>;
}

/// Create a PostgreSQL connection pool.
///
/// `max_connections` controls the maximum number of connections in the pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!(max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

/// PostgreSQL-backed audit store writing to the `notifications` table.
#[derive(Clone)]
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn record(&self, record: &AuditRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, notification_id, recipient, subject, body, kind, due_at, status, error_detail, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(record.notification_id)
        .bind(&record.recipient)
        .bind(&record.subject)
        .bind(&record.body)
        .bind(record.kind.to_string())
        .bind(record.due_at)
        .bind(record.status.to_string())
        .bind(&record.error_detail)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Audit store kept in process memory, for tests and deployments without PostgreSQL.
#[derive(Default)]
pub struct MemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn record(&self, record: &AuditRecord) -> Result<(), sqlx::Error> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

/// Audit store that drops every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditStore;

#[async_trait]
impl AuditStore for NoopAuditStore {
    async fn record(&self, _record: &AuditRecord) -> Result<(), sqlx::Error> {
        Ok(())
    }
}
