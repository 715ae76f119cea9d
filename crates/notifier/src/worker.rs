//! Dispatch worker — polls the delayed queue on a fixed tick and hands every
//! non-empty batch of due entries to its own task.
//!
//! Batches run concurrently with each other and with the poll loop, so a slow
//! batch never delays the next tick. Within a batch entries are sent one after
//! another in store order. Entries are already gone from the queue when a batch
//! starts: a failed send is logged and audited, never requeued.
//!
//! `run` returns only after every spawned batch has finished (drain). A batch
//! failing with a fatal error cancels the worker, and that first error is what
//! `run` returns.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use courier_common::audit::AuditStore;
use courier_common::metrics::Metrics;
use courier_common::types::{AuditRecord, DeliveryStatus};

use crate::queue::{DelayedQueue, QueueEntry, QueueError, QueuedNotification};
use crate::transport::{NotificationSender, SendError};

pub const OP_POLL: &str = "worker_poll";
pub const OP_DECODE: &str = "worker_decode";

#[derive(Debug, Error)]
pub enum WorkerError {
    /// Sending cannot succeed for any entry until the configuration is fixed.
    #[error("sender is misconfigured: {0}")]
    Misconfigured(#[source] SendError),

    #[error("batch task failed: {0}")]
    BatchTask(#[from] JoinError),
}

/// Polling worker for the delayed queue.
pub struct DispatchWorker {
    queue: Arc<DelayedQueue>,
    batch: Batch,
    tick_interval: Duration,
}

impl DispatchWorker {
    pub fn new(
        queue: Arc<DelayedQueue>,
        sender: Arc<dyn NotificationSender>,
        audit: Arc<dyn AuditStore>,
        metrics: Arc<dyn Metrics>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            queue,
            batch: Batch {
                sender,
                audit,
                metrics,
            },
            tick_interval,
        }
    }

    /// Run until `shutdown` is canceled or a batch fails fatally.
    ///
    /// Returns `Ok(())` on a clean, cancellation-triggered shutdown.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let token = shutdown.child_token();
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut batches: JoinSet<Result<(), WorkerError>> = JoinSet::new();
        let mut first_error: Option<WorkerError> = None;

        tracing::info!(
            queue = %self.queue.key(),
            tick_interval_ms = self.tick_interval.as_millis() as u64,
            "Dispatch worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(joined) = batches.join_next(), if !batches.is_empty() => {
                    Self::settle(joined, &token, &mut first_error);
                }
                _ = ticker.tick() => {
                    if let Some(entries) = self.poll(&token).await {
                        batches.spawn(self.batch.clone().process(entries, token.clone()));
                    }
                }
            }
        }

        if !batches.is_empty() {
            tracing::info!(
                in_flight = batches.len(),
                "Waiting for in-flight batches to finish"
            );
        }
        while let Some(joined) = batches.join_next().await {
            Self::settle(joined, &token, &mut first_error);
        }

        match first_error {
            Some(e) => {
                tracing::error!(error = %e, "Dispatch worker stopped with error");
                Err(e)
            }
            None => {
                tracing::info!("Dispatch worker stopped");
                Ok(())
            }
        }
    }

    /// One tick: pop everything due. Store failures skip the tick; nothing was
    /// removed, so the next tick sees the same entries.
    async fn poll(&self, token: &CancellationToken) -> Option<Vec<String>> {
        match self.queue.pop_due(token).await {
            Ok(entries) if entries.is_empty() => None,
            Ok(entries) => {
                tracing::info!(count = entries.len(), "Dispatching due notifications");
                Some(entries)
            }
            Err(QueueError::Canceled) => None,
            Err(e) => {
                if matches!(e, QueueError::Timeout { .. }) {
                    self.batch.metrics.inc_timeout(OP_POLL);
                } else {
                    self.batch.metrics.inc_error(OP_POLL);
                }
                tracing::warn!(error = %e, "Failed to poll delayed queue, skipping tick");
                None
            }
        }
    }

    fn settle(
        joined: Result<Result<(), WorkerError>, JoinError>,
        token: &CancellationToken,
        first_error: &mut Option<WorkerError>,
    ) {
        let outcome = joined.map_err(WorkerError::from).and_then(|result| result);
        if let Err(e) = outcome {
            tracing::error!(error = %e, "Batch failed, stopping dispatch worker");
            token.cancel();
            first_error.get_or_insert(e);
        }
    }
}

/// Everything a batch task needs, cloned into each spawned task.
#[derive(Clone)]
struct Batch {
    sender: Arc<dyn NotificationSender>,
    audit: Arc<dyn AuditStore>,
    metrics: Arc<dyn Metrics>,
}

impl Batch {
    async fn process(
        self,
        entries: Vec<String>,
        token: CancellationToken,
    ) -> Result<(), WorkerError> {
        let total = entries.len();

        for (index, raw) in entries.into_iter().enumerate() {
            if token.is_cancelled() {
                tracing::warn!(
                    abandoned = total - index,
                    "Batch canceled before all entries were sent"
                );
                return Ok(());
            }

            let QueuedNotification { id, payload } = match QueueEntry::decode(&raw) {
                Ok(queued) => queued,
                Err(e) => {
                    self.metrics.inc_error(OP_DECODE);
                    tracing::error!(
                        error = %e,
                        entry_len = raw.len(),
                        "Skipping undecodable queue entry"
                    );
                    continue;
                }
            };

            let content = payload.content();
            match self.sender.send(&token, content).await {
                Ok(()) => {
                    tracing::info!(
                        notification_id = %id,
                        recipient = %content.to,
                        "Delayed notification sent"
                    );
                    self.audit(
                        AuditRecord::new(&payload, DeliveryStatus::Sent).for_notification(id),
                    )
                    .await;
                }
                Err(SendError::Canceled) => {
                    tracing::warn!(
                        notification_id = %id,
                        recipient = %content.to,
                        abandoned = total - index,
                        "Batch canceled mid-send"
                    );
                    return Ok(());
                }
                Err(e @ SendError::InvalidSenderAddress { .. }) => {
                    return Err(WorkerError::Misconfigured(e));
                }
                Err(e) => {
                    tracing::error!(
                        notification_id = %id,
                        recipient = %content.to,
                        error = %e,
                        "Failed to send delayed notification, dropping it"
                    );
                    self.audit(
                        AuditRecord::new(&payload, DeliveryStatus::Failed)
                            .for_notification(id)
                            .with_error(e.to_string()),
                    )
                    .await;
                }
            }
        }

        Ok(())
    }

    async fn audit(&self, record: AuditRecord) {
        if let Err(e) = self.audit.record(&record).await {
            tracing::error!(
                notification_id = %record.notification_id,
                status = %record.status,
                error = %e,
                "Failed to write audit record"
            );
        }
    }
}
