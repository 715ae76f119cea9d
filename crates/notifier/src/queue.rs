//! Delayed queue — pending notifications held in a score-ordered set keyed by
//! due time (Unix seconds).
//!
//! "Everything due now" is one range query over `[-inf, now]`, and scheduling is
//! a single O(log n) insert. `pop_due` reads the due range and then removes
//! exactly the members it read. The two steps are not atomic: a crash or a
//! concurrent reader between them can hand the same entry out twice, so the
//! queue guarantees at-least-once delivery, never exactly-once.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::metrics::Metrics;
use courier_common::types::{EmailContent, NotificationPayload, ValidationError};

pub const OP_QUEUE_ADD: &str = "queue_add";
pub const OP_QUEUE_RANGE: &str = "queue_range";
pub const OP_QUEUE_REMOVE: &str = "queue_remove";

/// Redis key used when none is configured.
pub const DEFAULT_QUEUE_KEY: &str = "courier:delayed";

/// Store round-trip budget used when none is configured.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("only delayed notifications can be queued")]
    NotDelayed,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("invalid due time: {0}")]
    InvalidTime(String),

    #[error("failed to encode queue entry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("queue store error: {0}")]
    Store(#[from] StoreError),

    #[error("queue operation canceled")]
    Canceled,
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Validation(e) => AppError::from(e),
            QueueError::NotDelayed | QueueError::InvalidTime(_) => {
                AppError::Validation(err.to_string())
            }
            QueueError::Timeout { .. } | QueueError::Canceled => {
                AppError::Unavailable(err.to_string())
            }
            QueueError::Encode(_) | QueueError::Store(_) => AppError::Internal(err.to_string()),
        }
    }
}

/// Why a raw queue member could not be turned back into a payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed queue entry: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid due time '{0}' in queue entry")]
    DueTime(String),
}

/// Serialized form of a delayed notification as stored in the set.
///
/// `due_at` is the entry's score rendered as a decimal integer so the member
/// and its score never disagree. `id` keeps otherwise identical notifications
/// distinct members and links their audit records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub due_at: String,
}

/// A member decoded back into the notification it was queued as.
#[derive(Debug, Clone)]
pub struct QueuedNotification {
    pub id: Uuid,
    pub payload: NotificationPayload,
}

impl QueueEntry {
    /// Build the member and its score for notification `id` due at `due_at`.
    pub fn encode(
        id: Uuid,
        content: &EmailContent,
        due_at: DateTime<Utc>,
    ) -> Result<(i64, String), QueueError> {
        let score = due_at.timestamp();
        if score < 0 {
            return Err(QueueError::InvalidTime(format!(
                "{} is before the Unix epoch",
                due_at.to_rfc3339()
            )));
        }

        let entry = QueueEntry {
            id,
            to: content.to.clone(),
            subject: content.subject.clone(),
            body: content.body.clone(),
            due_at: score.to_string(),
        };

        Ok((score, serde_json::to_string(&entry)?))
    }

    /// Parse a raw member back into a delayed payload.
    pub fn decode(raw: &str) -> Result<QueuedNotification, DecodeError> {
        let entry: QueueEntry = serde_json::from_str(raw)?;
        let due_at = entry
            .due_at
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .ok_or_else(|| DecodeError::DueTime(entry.due_at.clone()))?;

        Ok(QueuedNotification {
            id: entry.id,
            payload: NotificationPayload::Delayed {
                content: EmailContent {
                    to: entry.to,
                    subject: entry.subject,
                    body: entry.body,
                },
                due_at,
            },
        })
    }
}

/// Score-ordered set of string members, the only capability the queue needs.
#[async_trait]
pub trait SortedSetStore: Send + Sync {
    /// Insert `member` under `score`, moving it if it already exists.
    async fn add(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError>;

    /// Members with a score in `[-inf, max]`, lowest score first.
    async fn range_by_score(&self, key: &str, max: i64) -> Result<Vec<String>, StoreError>;

    /// Remove `members`, returning how many were present.
    async fn remove(&self, key: &str, members: &[String]) -> Result<usize, StoreError>;
}

/// Redis sorted set (ZADD / ZRANGEBYSCORE / ZREM).
#[derive(Clone)]
pub struct RedisSortedSet {
    conn: ConnectionManager,
}

impl RedisSortedSet {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Open a connection manager for `redis_url`.
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;

        tracing::info!("Connected to Redis");
        Ok(Self::new(manager))
    }
}

#[async_trait]
impl SortedSetStore for RedisSortedSet {
    async fn add(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: usize = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn range_by_score(&self, key: &str, max: i64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.zrangebyscore(key, "-inf", max).await?;
        Ok(members)
    }

    async fn remove(&self, key: &str, members: &[String]) -> Result<usize, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: usize = conn.zrem(key, members.to_vec()).await?;
        Ok(removed)
    }
}

#[derive(Debug, Default)]
struct ScoredSet {
    by_score: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

/// In-process sorted set: a `(score, member)` B-tree plus a member index for
/// removal. Used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemorySortedSet {
    sets: Mutex<HashMap<String, ScoredSet>>,
}

impl MemorySortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of members stored under `key`.
    pub async fn len(&self, key: &str) -> usize {
        self.sets
            .lock()
            .await
            .get(key)
            .map(|set| set.scores.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SortedSetStore for MemorySortedSet {
    async fn add(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        let mut sets = self.sets.lock().await;
        let set = sets.entry(key.to_string()).or_default();
        if let Some(previous) = set.scores.insert(member.to_string(), score) {
            set.by_score.remove(&(previous, member.to_string()));
        }
        set.by_score.insert((score, member.to_string()));
        Ok(())
    }

    async fn range_by_score(&self, key: &str, max: i64) -> Result<Vec<String>, StoreError> {
        let sets = self.sets.lock().await;
        let Some(set) = sets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(set
            .by_score
            .iter()
            .take_while(|(score, _)| *score <= max)
            .map(|(_, member)| member.clone())
            .collect())
    }

    async fn remove(&self, key: &str, members: &[String]) -> Result<usize, StoreError> {
        let mut sets = self.sets.lock().await;
        let Some(set) = sets.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0;
        for member in members {
            if let Some(score) = set.scores.remove(member) {
                set.by_score.remove(&(score, member.clone()));
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Time-ordered queue of pending delayed notifications.
pub struct DelayedQueue {
    store: Arc<dyn SortedSetStore>,
    key: String,
    timeout: Duration,
    metrics: Arc<dyn Metrics>,
}

impl DelayedQueue {
    /// `timeout` bounds every store round-trip; `None` uses [`DEFAULT_STORE_TIMEOUT`].
    pub fn new(
        store: Arc<dyn SortedSetStore>,
        key: impl Into<String>,
        timeout: Option<Duration>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            timeout: timeout.unwrap_or(DEFAULT_STORE_TIMEOUT),
            metrics,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Schedule a delayed notification under its due time, returning the id
    /// it was queued under.
    pub async fn enqueue(
        &self,
        token: &CancellationToken,
        payload: &NotificationPayload,
    ) -> Result<Uuid, QueueError> {
        let NotificationPayload::Delayed { content, due_at } = payload else {
            return Err(QueueError::NotDelayed);
        };

        payload.validate(Utc::now())?;
        let id = Uuid::new_v4();
        let (score, member) = QueueEntry::encode(id, content, *due_at)?;

        self.round_trip(OP_QUEUE_ADD, token, self.store.add(&self.key, score, &member))
            .await?;

        tracing::debug!(
            notification_id = %id,
            recipient = %content.to,
            due_at = score,
            "Notification queued"
        );
        Ok(id)
    }

    /// Remove and return every entry due at the current wall-clock second.
    pub async fn pop_due(&self, token: &CancellationToken) -> Result<Vec<String>, QueueError> {
        self.pop_due_at(token, Utc::now()).await
    }

    /// Remove and return every entry with a score at or before `now`.
    ///
    /// A failed delete is logged and the read entries are still returned: they
    /// were already handed out and may be delivered again on a later poll.
    pub async fn pop_due_at(
        &self,
        token: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, QueueError> {
        let max = now.timestamp();
        let members = self
            .round_trip(OP_QUEUE_RANGE, token, self.store.range_by_score(&self.key, max))
            .await?;

        if members.is_empty() {
            return Ok(members);
        }

        match self
            .round_trip(OP_QUEUE_REMOVE, token, self.store.remove(&self.key, &members))
            .await
        {
            Ok(removed) if removed < members.len() => {
                tracing::debug!(
                    read = members.len(),
                    removed,
                    "Some due entries were already removed by another reader"
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    key = %self.key,
                    count = members.len(),
                    error = %e,
                    "Failed to remove due entries; they may be delivered again"
                );
            }
        }

        Ok(members)
    }

    /// Run one store call under the per-call timeout and the caller's token,
    /// recording its latency and outcome under `op`.
    async fn round_trip<T>(
        &self,
        op: &'static str,
        token: &CancellationToken,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, QueueError> {
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(QueueError::Canceled),
            result = tokio::time::timeout(self.timeout, call) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(QueueError::Store(e)),
                Err(_) => Err(QueueError::Timeout {
                    op,
                    timeout: self.timeout,
                }),
            },
        };

        match &outcome {
            Ok(_) => self.metrics.inc_success(op),
            Err(QueueError::Canceled) => self.metrics.inc_canceled(op),
            Err(QueueError::Timeout { .. }) => self.metrics.inc_timeout(op),
            Err(_) => self.metrics.inc_error(op),
        }
        self.metrics.observe(op, started);

        outcome
    }
}
