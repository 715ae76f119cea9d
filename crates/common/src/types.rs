use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Discriminator for notification payloads at the JSON boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum NotificationKind {
    Instant,
    Delayed,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationKind::Instant => write!(f, "instant"),
            NotificationKind::Delayed => write!(f, "delayed"),
        }
    }
}

/// Notification delivery status as recorded in the audit store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Queued => write!(f, "queued"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Reasons a notification payload is rejected before it reaches the queue or
/// the mail transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid recipient address '{0}'")]
    InvalidRecipient(String),

    #[error("subject must not be empty")]
    EmptySubject,

    #[error("body must not be empty")]
    EmptyBody,

    #[error("due time is required for delayed notifications")]
    MissingDueTime,

    #[error("invalid due time '{0}': expected RFC 3339")]
    InvalidDueTime(String),

    #[error("due time {due_at} is not in the future")]
    DueTimeNotInFuture { due_at: DateTime<Utc> },
}

/// The addressable part of every notification: one recipient, one plain-text
/// message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailContent {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl EmailContent {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Check the recipient address and that subject and body carry text.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if lettre::Address::from_str(self.to.trim()).is_err() {
            return Err(ValidationError::InvalidRecipient(self.to.clone()));
        }
        if self.subject.trim().is_empty() {
            return Err(ValidationError::EmptySubject);
        }
        if self.body.trim().is_empty() {
            return Err(ValidationError::EmptyBody);
        }
        Ok(())
    }
}

/// A notification as accepted by the system: either sent right away or held
/// in the delayed queue until `due_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationPayload {
    Instant(EmailContent),
    Delayed {
        content: EmailContent,
        due_at: DateTime<Utc>,
    },
}

impl NotificationPayload {
    pub fn kind(&self) -> NotificationKind {
        match self {
            NotificationPayload::Instant(_) => NotificationKind::Instant,
            NotificationPayload::Delayed { .. } => NotificationKind::Delayed,
        }
    }

    pub fn content(&self) -> &EmailContent {
        match self {
            NotificationPayload::Instant(content) => content,
            NotificationPayload::Delayed { content, .. } => content,
        }
    }

    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        match self {
            NotificationPayload::Instant(_) => None,
            NotificationPayload::Delayed { due_at, .. } => Some(*due_at),
        }
    }

    /// Validate the payload against the clock reading `now`.
    ///
    /// A delayed payload must be due strictly after `now`.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.content().validate()?;
        if let Some(due_at) = self.due_at() {
            if due_at <= now {
                return Err(ValidationError::DueTimeNotInFuture { due_at });
            }
        }
        Ok(())
    }
}

/// Durable record of a notification written after it was sent, queued or
/// failed.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditRecord {
    pub id: Uuid,
    /// Shared by every record written for the same notification.
    pub notification_id: Uuid,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub kind: NotificationKind,
    pub due_at: Option<DateTime<Utc>>,
    pub status: DeliveryStatus,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(payload: &NotificationPayload, status: DeliveryStatus) -> Self {
        let content = payload.content();
        Self {
            id: Uuid::new_v4(),
            notification_id: Uuid::new_v4(),
            recipient: content.to.clone(),
            subject: content.subject.clone(),
            body: content.body.clone(),
            kind: payload.kind(),
            due_at: payload.due_at(),
            status,
            error_detail: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_notification(mut self, notification_id: Uuid) -> Self {
        self.notification_id = notification_id;
        self
    }

    pub fn with_error(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn content() -> EmailContent {
        EmailContent::new("a@example.com", "S", "M")
    }

    #[test]
    fn test_valid_instant_payload() {
        let payload = NotificationPayload::Instant(content());
        assert!(payload.validate(Utc::now()).is_ok());
        assert_eq!(payload.kind(), NotificationKind::Instant);
        assert_eq!(payload.due_at(), None);
    }

    #[test]
    fn test_rejects_bad_recipient() {
        let payload = NotificationPayload::Instant(EmailContent::new("not-an-address", "S", "M"));
        assert_eq!(
            payload.validate(Utc::now()),
            Err(ValidationError::InvalidRecipient("not-an-address".to_string()))
        );
    }

    #[test]
    fn test_rejects_blank_subject_and_body() {
        let blank_subject = NotificationPayload::Instant(EmailContent::new("a@example.com", "  ", "M"));
        assert_eq!(blank_subject.validate(Utc::now()), Err(ValidationError::EmptySubject));

        let blank_body = NotificationPayload::Instant(EmailContent::new("a@example.com", "S", ""));
        assert_eq!(blank_body.validate(Utc::now()), Err(ValidationError::EmptyBody));
    }

    #[test]
    fn test_delayed_due_time_must_be_in_future() {
        let now = Utc::now();
        let past = NotificationPayload::Delayed {
            content: content(),
            due_at: now,
        };
        assert!(matches!(
            past.validate(now),
            Err(ValidationError::DueTimeNotInFuture { .. })
        ));

        let future = NotificationPayload::Delayed {
            content: content(),
            due_at: now + Duration::seconds(1),
        };
        assert!(future.validate(now).is_ok());
        assert_eq!(future.kind(), NotificationKind::Delayed);
    }

    #[test]
    fn test_audit_record_from_payload() {
        let due_at = Utc::now() + Duration::minutes(5);
        let payload = NotificationPayload::Delayed {
            content: content(),
            due_at,
        };
        let record = AuditRecord::new(&payload, DeliveryStatus::Failed).with_error("smtp down");
        assert_eq!(record.recipient, "a@example.com");
        assert_eq!(record.kind, NotificationKind::Delayed);
        assert_eq!(record.due_at, Some(due_at));
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.error_detail.as_deref(), Some("smtp down"));
        assert_ne!(record.notification_id, record.id);
    }

    #[test]
    fn test_records_for_one_notification_share_its_id() {
        let payload = NotificationPayload::Instant(content());
        let notification_id = Uuid::new_v4();

        let queued =
            AuditRecord::new(&payload, DeliveryStatus::Queued).for_notification(notification_id);
        let sent =
            AuditRecord::new(&payload, DeliveryStatus::Sent).for_notification(notification_id);
        assert_eq!(queued.notification_id, sent.notification_id);
        assert_ne!(queued.id, sent.id);
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&NotificationKind::Delayed).unwrap(),
            "\"delayed\""
        );
        assert_eq!(DeliveryStatus::Queued.to_string(), "queued");
    }
}
