use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection string (delayed queue store)
    pub redis_url: String,

    /// PostgreSQL connection string for the audit store. Auditing is disabled when unset.
    pub database_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// SMTP submission host
    pub smtp_host: String,

    /// SMTP submission port (default: 587)
    pub smtp_port: u16,

    /// SMTP credentials, used only when both are set
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,

    /// Negotiate STARTTLS with the SMTP host (default: true)
    pub smtp_tls: bool,

    /// SMTP connection timeout in seconds (default: 10)
    pub smtp_timeout_secs: u64,

    /// Sender mailbox for every outgoing message
    pub email_from: String,

    /// Retries after the first failed delivery attempt (default: 3)
    pub smtp_max_retries: u32,

    /// Base backoff between delivery retries in milliseconds (default: 3000)
    pub smtp_retry_pause_ms: u64,

    /// Redis sorted-set key holding delayed notifications
    pub queue_key: String,

    /// Per-call timeout for queue store round-trips in milliseconds (default: 5000)
    pub queue_timeout_ms: u64,

    /// Dispatch worker poll interval in milliseconds (default: 1000)
    pub worker_tick_interval_ms: u64,

    /// HTTP listen port for the API server (default: 3000)
    pub api_port: u16,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            database_url: std::env::var("DATABASE_URL").ok(),
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", 20)?,
            smtp_host: std::env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
            smtp_port: parse_env("SMTP_PORT", 587)?,
            smtp_username: std::env::var("SMTP_USERNAME").ok(),
            smtp_password: std::env::var("SMTP_PASSWORD").ok(),
            smtp_tls: parse_env("SMTP_TLS", true)?,
            smtp_timeout_secs: parse_env("SMTP_TIMEOUT_SECS", 10)?,
            email_from: std::env::var("EMAIL_FROM")
                .map_err(|_| anyhow::anyhow!("EMAIL_FROM environment variable is required"))?,
            smtp_max_retries: parse_env("SMTP_MAX_RETRIES", 3)?,
            smtp_retry_pause_ms: parse_env("SMTP_RETRY_PAUSE_MS", 3000)?,
            queue_key: std::env::var("QUEUE_KEY")
                .unwrap_or_else(|_| "courier:delayed".to_string()),
            queue_timeout_ms: parse_env("QUEUE_TIMEOUT_MS", 5000)?,
            worker_tick_interval_ms: parse_env("WORKER_TICK_INTERVAL_MS", 1000)?,
            api_port: parse_env("API_PORT", 3000)?,
        })
    }

    pub fn smtp_timeout(&self) -> Duration {
        Duration::from_secs(self.smtp_timeout_secs)
    }

    pub fn smtp_retry_pause(&self) -> Duration {
        Duration::from_millis(self.smtp_retry_pause_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn worker_tick_interval(&self) -> Duration {
        Duration::from_millis(self.worker_tick_interval_ms)
    }
}

/// Read `name` from the environment, falling back to `default` when unset.
fn parse_env<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}
