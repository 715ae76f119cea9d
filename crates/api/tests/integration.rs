//! Integration tests for API routes.
//!
//! Uses `tower::ServiceExt` to drive the Axum router without a real HTTP
//! server. The queue, sender and audit store are in-memory stand-ins, so no
//! Redis, PostgreSQL or mail host is needed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use courier_api::routes::create_router;
use courier_api::state::AppState;
use courier_common::audit::MemoryAuditStore;
use courier_common::metrics::InMemoryMetrics;
use courier_common::types::{DeliveryStatus, EmailContent};
use courier_notifier::queue::{
    DelayedQueue, MemorySortedSet, OP_QUEUE_ADD, SortedSetStore, StoreError,
};
use courier_notifier::transport::{NotificationSender, SendError, TransportError};

const KEY: &str = "courier:test";

// ============================================================
// Helpers
// ============================================================

/// Sender that records every recipient and optionally fails.
#[derive(Default)]
struct RecordingSender {
    fail: bool,
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(
        &self,
        _token: &CancellationToken,
        content: &EmailContent,
    ) -> Result<(), SendError> {
        self.sent.lock().unwrap().push(content.to.clone());
        if self.fail {
            return Err(SendError::DeliveryExhausted {
                attempts: 4,
                source: TransportError::Unavailable("connection refused".to_string()),
            });
        }
        Ok(())
    }
}

/// Store whose calls never complete.
struct StalledStore;

#[async_trait]
impl SortedSetStore for StalledStore {
    async fn add(&self, _key: &str, _score: i64, _member: &str) -> Result<(), StoreError> {
        std::future::pending().await
    }

    async fn range_by_score(&self, _key: &str, _max: i64) -> Result<Vec<String>, StoreError> {
        std::future::pending().await
    }

    async fn remove(&self, _key: &str, _members: &[String]) -> Result<usize, StoreError> {
        std::future::pending().await
    }
}

struct Harness {
    state: AppState,
    store: Arc<MemorySortedSet>,
    sender: Arc<RecordingSender>,
    audit: Arc<MemoryAuditStore>,
}

fn harness(fail_sends: bool) -> Harness {
    let metrics = Arc::new(InMemoryMetrics::new());
    let store = Arc::new(MemorySortedSet::new());
    let queue = Arc::new(DelayedQueue::new(store.clone(), KEY, None, metrics.clone()));
    let sender = Arc::new(RecordingSender {
        fail: fail_sends,
        ..Default::default()
    });
    let audit = Arc::new(MemoryAuditStore::new());

    let state = AppState::new(queue, sender.clone(), audit.clone(), metrics);
    Harness {
        state,
        store,
        sender,
        audit,
    }
}

async fn post_notification(state: AppState, body: serde_json::Value) -> Response {
    create_router(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/notifications")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn json_body(response: Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn in_an_hour() -> String {
    (Utc::now() + chrono::Duration::hours(1)).to_rfc3339()
}

// ============================================================
// Health and metrics
// ============================================================

#[tokio::test]
async fn test_health_endpoint() {
    let h = harness(false);
    let response = create_router(h.state)
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "courier-api");
    assert_eq!(json["queue_key"], KEY);
}

#[tokio::test]
async fn test_metrics_reflect_queued_notification() {
    let h = harness(false);
    let response = post_notification(
        h.state.clone(),
        serde_json::json!({
            "to": "a@example.com",
            "subject": "S",
            "body": "M",
            "type": "delayed",
            "due_time": in_an_hour()
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = create_router(h.state)
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json[OP_QUEUE_ADD]["success"], 1);
    assert_eq!(json[OP_QUEUE_ADD]["error"], 0);
}

// ============================================================
// Instant notifications
// ============================================================

#[tokio::test]
async fn test_instant_notification_is_sent_and_audited() {
    let h = harness(false);
    let response = post_notification(
        h.state,
        serde_json::json!({
            "to": "a@example.com",
            "subject": "Hello",
            "body": "World",
            "type": "instant"
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "sent");
    assert_eq!(*h.sender.sent.lock().unwrap(), vec!["a@example.com"]);
    assert_eq!(h.store.len(KEY).await, 0);

    let records = h.audit.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DeliveryStatus::Sent);
    assert_eq!(records[0].subject, "Hello");
}

#[tokio::test]
async fn test_instant_delivery_failure_is_bad_gateway() {
    let h = harness(true);
    let response = post_notification(
        h.state,
        serde_json::json!({
            "to": "a@example.com",
            "subject": "S",
            "body": "M",
            "type": "instant"
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let json = json_body(response).await;
    assert!(json["error"].as_str().unwrap().contains("4 attempts"));

    let records = h.audit.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DeliveryStatus::Failed);
    assert!(records[0].error_detail.is_some());
}

#[tokio::test]
async fn test_invalid_recipient_is_rejected_before_sending() {
    let h = harness(false);
    let response = post_notification(
        h.state,
        serde_json::json!({
            "to": "not-an-address",
            "subject": "S",
            "body": "M",
            "type": "instant"
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(h.sender.sent.lock().unwrap().is_empty());
    assert!(h.audit.records().await.is_empty());
}

#[tokio::test]
async fn test_blank_subject_is_rejected() {
    let h = harness(false);
    let response = post_notification(
        h.state,
        serde_json::json!({
            "to": "a@example.com",
            "subject": "   ",
            "body": "M",
            "type": "instant"
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(h.sender.sent.lock().unwrap().is_empty());
}

// ============================================================
// Delayed notifications
// ============================================================

#[tokio::test]
async fn test_delayed_notification_is_queued() {
    let h = harness(false);
    let due = in_an_hour();
    let response = post_notification(
        h.state,
        serde_json::json!({
            "to": "a@example.com",
            "subject": "S",
            "body": "M",
            "type": "delayed",
            "due_time": due
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = json_body(response).await;
    assert_eq!(json["status"], "queued");
    assert!(json["due_at"].is_string());
    let id = json["id"].as_str().unwrap().to_string();

    assert_eq!(h.store.len(KEY).await, 1);
    assert!(h.sender.sent.lock().unwrap().is_empty());

    let records = h.audit.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DeliveryStatus::Queued);
    assert_eq!(records[0].notification_id.to_string(), id);
    assert!(records[0].due_at.is_some());
}

#[tokio::test]
async fn test_repeated_delayed_notification_is_queued_twice() {
    let h = harness(false);
    let body = serde_json::json!({
        "to": "a@example.com",
        "subject": "Reminder",
        "body": "Pay rent",
        "type": "delayed",
        "due_time": in_an_hour()
    });

    let mut ids = Vec::new();
    for _ in 0..2 {
        let response = post_notification(h.state.clone(), body.clone()).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        ids.push(json_body(response).await["id"].as_str().unwrap().to_string());
    }
    assert_ne!(ids[0], ids[1]);
    assert_eq!(h.store.len(KEY).await, 2);

    let audited: Vec<String> = h
        .audit
        .records()
        .await
        .iter()
        .map(|r| r.notification_id.to_string())
        .collect();
    assert_eq!(audited, ids);
}

#[tokio::test]
async fn test_delayed_without_due_time_is_rejected() {
    let h = harness(false);
    let response = post_notification(
        h.state,
        serde_json::json!({
            "to": "a@example.com",
            "subject": "S",
            "body": "M",
            "type": "delayed"
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(h.store.len(KEY).await, 0);
}

#[tokio::test]
async fn test_delayed_with_past_due_time_is_rejected() {
    let h = harness(false);
    let response = post_notification(
        h.state,
        serde_json::json!({
            "to": "a@example.com",
            "subject": "S",
            "body": "M",
            "type": "delayed",
            "due_time": (Utc::now() - chrono::Duration::minutes(5)).to_rfc3339()
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert!(json["error"].as_str().unwrap().contains("not in the future"));
    assert_eq!(h.store.len(KEY).await, 0);
}

#[tokio::test]
async fn test_delayed_with_malformed_due_time_is_rejected() {
    let h = harness(false);
    let response = post_notification(
        h.state,
        serde_json::json!({
            "to": "a@example.com",
            "subject": "S",
            "body": "M",
            "type": "delayed",
            "due_time": "next tuesday"
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_type_is_unprocessable() {
    let h = harness(false);
    let response = post_notification(
        h.state,
        serde_json::json!({
            "to": "a@example.com",
            "subject": "S",
            "body": "M",
            "type": "carrier-pigeon"
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_stalled_queue_is_service_unavailable() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let queue = Arc::new(DelayedQueue::new(
        Arc::new(StalledStore),
        KEY,
        Some(Duration::from_millis(50)),
        metrics.clone(),
    ));
    let audit = Arc::new(MemoryAuditStore::new());
    let state = AppState::new(
        queue,
        Arc::new(RecordingSender::default()),
        audit.clone(),
        metrics,
    );

    let response = post_notification(
        state,
        serde_json::json!({
            "to": "a@example.com",
            "subject": "S",
            "body": "M",
            "type": "delayed",
            "due_time": in_an_hour()
        }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(audit.records().await.is_empty());
}
