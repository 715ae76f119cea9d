//! Notification intake — instant sends and delayed scheduling.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    AuditRecord, DeliveryStatus, EmailContent, NotificationKind, NotificationPayload,
    ValidationError,
};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/notifications", post(create_notification))
}

/// Request body for a new notification.
#[derive(Debug, Deserialize)]
pub struct NotificationRequest {
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// RFC 3339 timestamp; required for delayed notifications.
    #[serde(default)]
    pub due_time: Option<String>,
}

impl NotificationRequest {
    /// Convert into a typed payload. Content checks are left to `validate`.
    pub fn into_payload(self) -> Result<NotificationPayload, ValidationError> {
        let content = EmailContent::new(self.to, self.subject, self.body);
        match self.kind {
            NotificationKind::Instant => Ok(NotificationPayload::Instant(content)),
            NotificationKind::Delayed => {
                let raw = self.due_time.ok_or(ValidationError::MissingDueTime)?;
                let due_at = DateTime::parse_from_rfc3339(raw.trim())
                    .map_err(|_| ValidationError::InvalidDueTime(raw.clone()))?
                    .with_timezone(&Utc);
                Ok(NotificationPayload::Delayed { content, due_at })
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NotificationResponse {
    /// Links every audit record written for this notification.
    pub id: Uuid,
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
}

/// POST /api/notifications — Send now, or schedule for `due_time`.
async fn create_notification(
    State(state): State<AppState>,
    Json(req): Json<NotificationRequest>,
) -> Result<(StatusCode, Json<NotificationResponse>), AppError> {
    let payload = req.into_payload()?;
    payload.validate(Utc::now())?;

    let token = state.shutdown.child_token();

    match &payload {
        NotificationPayload::Instant(content) => {
            let id = Uuid::new_v4();
            if let Err(e) = state.sender.send(&token, content).await {
                tracing::warn!(
                    notification_id = %id,
                    recipient = %content.to,
                    error = %e,
                    "Instant notification failed"
                );
                record(
                    &state,
                    AuditRecord::new(&payload, DeliveryStatus::Failed)
                        .for_notification(id)
                        .with_error(e.to_string()),
                )
                .await;
                return Err(e.into());
            }

            tracing::info!(
                notification_id = %id,
                recipient = %content.to,
                "Instant notification sent"
            );
            record(
                &state,
                AuditRecord::new(&payload, DeliveryStatus::Sent).for_notification(id),
            )
            .await;

            Ok((
                StatusCode::OK,
                Json(NotificationResponse {
                    id,
                    status: DeliveryStatus::Sent,
                    due_at: None,
                }),
            ))
        }
        NotificationPayload::Delayed { content, due_at } => {
            let id = state.queue.enqueue(&token, &payload).await?;

            tracing::info!(
                notification_id = %id,
                recipient = %content.to,
                due_at = %due_at,
                "Delayed notification queued"
            );
            record(
                &state,
                AuditRecord::new(&payload, DeliveryStatus::Queued).for_notification(id),
            )
            .await;

            Ok((
                StatusCode::ACCEPTED,
                Json(NotificationResponse {
                    id,
                    status: DeliveryStatus::Queued,
                    due_at: Some(*due_at),
                }),
            ))
        }
    }
}

async fn record(state: &AppState, record: AuditRecord) {
    if let Err(e) = state.audit.record(&record).await {
        tracing::error!(
            notification_id = %record.notification_id,
            error = %e,
            "Failed to write audit record"
        );
    }
}
