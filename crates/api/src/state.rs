//! Shared application state for the Axum API server.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use courier_common::audit::AuditStore;
use courier_common::metrics::InMemoryMetrics;
use courier_notifier::queue::DelayedQueue;
use courier_notifier::transport::NotificationSender;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<DelayedQueue>,
    pub sender: Arc<dyn NotificationSender>,
    pub audit: Arc<dyn AuditStore>,
    pub metrics: Arc<InMemoryMetrics>,
    /// Canceled on server shutdown; in-flight sends and queue calls observe it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        queue: Arc<DelayedQueue>,
        sender: Arc<dyn NotificationSender>,
        audit: Arc<dyn AuditStore>,
        metrics: Arc<InMemoryMetrics>,
    ) -> Self {
        Self {
            queue,
            sender,
            audit,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }
}
