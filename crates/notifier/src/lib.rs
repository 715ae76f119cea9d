//! Delayed email delivery engine.
//!
//! - [`transport`]: sends one message with bounded exponential backoff.
//! - [`queue`]: time-ordered store of pending notifications.
//! - [`worker`]: polls the queue and dispatches due batches.
//!
//! Delivery is at-least-once and best-effort: entries are removed from the
//! queue before they are sent and are never requeued.

pub mod queue;
pub mod transport;
pub mod worker;
