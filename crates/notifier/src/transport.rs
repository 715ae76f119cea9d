//! Transport client — delivers one plain-text message to one recipient over
//! SMTP with bounded exponential backoff.
//!
//! Every call to [`EmailClient::send`] walks the same states:
//! validate sender → validate recipient → attempt 0 → (backoff → attempt i)*.
//! Cancellation is checked before the first attempt, races every attempt and
//! interrupts backoff sleeps.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use courier_common::config::AppConfig;
use courier_common::error::AppError;
use courier_common::metrics::Metrics;
use courier_common::types::{EmailContent, ValidationError};

/// Metrics operation name for a whole `send` call, retries included.
pub const OP_SEND_EMAIL: &str = "send_email";

/// Default number of retries after the first failed attempt.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base pause between retries.
const DEFAULT_RETRY_PAUSE: Duration = Duration::from_secs(3);

/// Failure of a single delivery attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("mail host unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a whole `send` call.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("invalid sender address '{address}': {reason}")]
    InvalidSenderAddress { address: String, reason: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("send canceled")]
    Canceled,

    #[error("delivery failed after {attempts} attempts: {source}")]
    DeliveryExhausted {
        attempts: u32,
        #[source]
        source: TransportError,
    },
}

impl From<SendError> for AppError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::Validation(e) => AppError::from(e),
            SendError::InvalidSenderAddress { .. } => AppError::Config(err.to_string()),
            SendError::Canceled => AppError::Unavailable(err.to_string()),
            SendError::Build(_) | SendError::DeliveryExhausted { .. } => {
                AppError::Delivery(err.to_string())
            }
        }
    }
}

/// One delivery attempt against a mail-transfer host.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, message: Message) -> Result<(), TransportError>;
}

/// Connection settings for [`SmtpMailTransport`].
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
    pub tls: bool,
    pub timeout: Duration,
}

impl SmtpSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let credentials = match (&config.smtp_username, &config.smtp_password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };

        Self {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            credentials,
            tls: config.smtp_tls,
            timeout: config.smtp_timeout(),
        }
    }
}

/// SMTP submission over lettre's async transport. Without the `pool` feature
/// every delivery opens its own connection.
pub struct SmtpMailTransport {
    inner: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailTransport {
    pub fn new(settings: &SmtpSettings) -> Result<Self, TransportError> {
        let mut builder = if settings.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
        };

        builder = builder.port(settings.port).timeout(Some(settings.timeout));

        if let Some((user, password)) = &settings.credentials {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }

        tracing::info!(
            host = %settings.host,
            port = settings.port,
            tls = settings.tls,
            "SMTP transport configured"
        );

        Ok(Self {
            inner: builder.build(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn deliver(&self, message: Message) -> Result<(), TransportError> {
        self.inner.send(message).await?;
        Ok(())
    }
}

/// Retry budget and backoff base for [`EmailClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed after the first failure.
    pub max_retries: u32,
    /// Pause before the first retry; doubles for every retry after it.
    pub base_pause: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_pause: Duration) -> Self {
        Self {
            max_retries,
            base_pause,
        }
    }

    /// Pause inserted before attempt `attempt` (0 is the initial attempt).
    ///
    /// `base_pause * 2^(attempt - 1)` for retries, zero for the first try.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_pause.saturating_mul(factor)
    }

    /// Total attempts a failing send makes before giving up.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_PAUSE)
    }
}

/// Anything that can deliver a notification's content, retries included.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(
        &self,
        token: &CancellationToken,
        content: &EmailContent,
    ) -> Result<(), SendError>;
}

/// Email client with a static sender, retry policy and metrics sink.
pub struct EmailClient {
    from: String,
    transport: Arc<dyn MailTransport>,
    policy: RetryPolicy,
    metrics: Arc<dyn Metrics>,
}

impl EmailClient {
    pub fn new(
        from: impl Into<String>,
        transport: Arc<dyn MailTransport>,
        policy: RetryPolicy,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            from: from.into(),
            transport,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Parse the configured sender. Also run by every `send`.
    pub fn sender_mailbox(&self) -> Result<Mailbox, SendError> {
        Mailbox::from_str(self.from.trim()).map_err(|e| SendError::InvalidSenderAddress {
            address: self.from.clone(),
            reason: e.to_string(),
        })
    }

    fn build_message(&self, content: &EmailContent) -> Result<Message, SendError> {
        let from = self.sender_mailbox()?;
        content.validate()?;
        let to = Mailbox::from_str(content.to.trim())
            .map_err(|_| ValidationError::InvalidRecipient(content.to.clone()))?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(content.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(content.body.clone())?;

        Ok(message)
    }

    async fn send_with_retry(
        &self,
        token: &CancellationToken,
        content: &EmailContent,
    ) -> Result<(), SendError> {
        if token.is_cancelled() {
            return Err(SendError::Canceled);
        }

        let message = self.build_message(content)?;
        let mut last_error = None;

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                if token.is_cancelled() {
                    return Err(SendError::Canceled);
                }

                let pause = self.policy.backoff(attempt);
                tracing::debug!(
                    recipient = %content.to,
                    attempt,
                    pause_ms = pause.as_millis() as u64,
                    "Backing off before retry"
                );

                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(SendError::Canceled),
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(SendError::Canceled),
                outcome = self.transport.deliver(message.clone()) => outcome,
            };

            match outcome {
                Ok(()) => {
                    tracing::debug!(recipient = %content.to, attempt, "Message accepted by mail host");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        recipient = %content.to,
                        attempt,
                        max_retries = self.policy.max_retries,
                        error = %e,
                        "Delivery attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(SendError::DeliveryExhausted {
            attempts: self.policy.total_attempts(),
            source: last_error.unwrap_or_else(|| {
                TransportError::Unavailable("no delivery attempt was made".to_string())
            }),
        })
    }
}

#[async_trait]
impl NotificationSender for EmailClient {
    async fn send(
        &self,
        token: &CancellationToken,
        content: &EmailContent,
    ) -> Result<(), SendError> {
        let started = Instant::now();
        let result = self.send_with_retry(token, content).await;

        match &result {
            Ok(()) => self.metrics.inc_success(OP_SEND_EMAIL),
            Err(SendError::Canceled) => self.metrics.inc_canceled(OP_SEND_EMAIL),
            Err(_) => self.metrics.inc_error(OP_SEND_EMAIL),
        }
        self.metrics.observe(OP_SEND_EMAIL, started);

        result
    }
}
