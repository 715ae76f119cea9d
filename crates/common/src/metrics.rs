//! Metrics interface shared by the transport client, the delayed queue and the
//! dispatch worker.
//!
//! Components receive an `Arc<dyn Metrics>` in their constructor; nothing is
//! registered globally. `NoopMetrics` is for callers that run without
//! instrumentation, `InMemoryMetrics` keeps per-operation counters that the API
//! exposes as JSON.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;

/// Sink for per-operation outcome counters and latency observations.
pub trait Metrics: Send + Sync {
    fn inc_success(&self, op: &'static str);
    fn inc_error(&self, op: &'static str);
    fn inc_canceled(&self, op: &'static str);
    fn inc_timeout(&self, op: &'static str);

    /// Record the time elapsed since `started` for `op`.
    fn observe(&self, op: &'static str, started: Instant);
}

/// Metrics sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn inc_success(&self, _op: &'static str) {}
    fn inc_error(&self, _op: &'static str) {}
    fn inc_canceled(&self, _op: &'static str) {}
    fn inc_timeout(&self, _op: &'static str) {}
    fn observe(&self, _op: &'static str, _started: Instant) {}
}

/// Counters for a single operation name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OpStats {
    pub success: u64,
    pub error: u64,
    pub canceled: u64,
    pub timeout: u64,
    pub observations: u64,
    pub total_micros: u64,
}

/// Process-local metrics store.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    ops: Mutex<BTreeMap<&'static str, OpStats>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the counters for every operation seen so far.
    pub fn snapshot(&self) -> BTreeMap<&'static str, OpStats> {
        self.lock().clone()
    }

    /// Counters for one operation; zeroed if it was never recorded.
    pub fn get(&self, op: &str) -> OpStats {
        self.lock().get(op).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<&'static str, OpStats>> {
        // Counters stay usable even if a recording thread panicked.
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, op: &'static str, f: impl FnOnce(&mut OpStats)) {
        f(self.lock().entry(op).or_default());
    }
}

impl Metrics for InMemoryMetrics {
    fn inc_success(&self, op: &'static str) {
        self.update(op, |s| s.success += 1);
    }

    fn inc_error(&self, op: &'static str) {
        self.update(op, |s| s.error += 1);
    }

    fn inc_canceled(&self, op: &'static str) {
        self.update(op, |s| s.canceled += 1);
    }

    fn inc_timeout(&self, op: &'static str) {
        self.update(op, |s| s.timeout += 1);
    }

    fn observe(&self, op: &'static str, started: Instant) {
        let micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.update(op, |s| {
            s.observations += 1;
            s.total_micros = s.total_micros.saturating_add(micros);
        });
    }
}
