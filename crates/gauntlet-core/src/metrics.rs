//! Global atomic counters for Gauntlet observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a sprint).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations and no locking.
pub struct Metrics {
    attempts_started: AtomicU64,
    retries: AtomicU64,
    escalations: AtomicU64,
    checkpoints_created: AtomicU64,
    events_emitted: AtomicU64,
    delivery_failures: AtomicU64,
    degraded_decisions: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            attempts_started: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            escalations: AtomicU64::new(0),
            checkpoints_created: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
            degraded_decisions: AtomicU64::new(0),
        }
    }

    counter!(inc_attempts, attempts_started, attempts_started);
    counter!(inc_retries, retries, retries);
    counter!(inc_escalations, escalations, escalations);
    counter!(inc_checkpoints, checkpoints_created, checkpoints_created);
    counter!(inc_events_emitted, events_emitted, events_emitted);
    counter!(inc_delivery_failures, delivery_failures, delivery_failures);
    counter!(inc_degraded_decisions, degraded_decisions, degraded_decisions);

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a sprint, CLI exit)
    /// rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            attempts_started = self.attempts_started(),
            retries = self.retries(),
            escalations = self.escalations(),
            checkpoints_created = self.checkpoints_created(),
            events_emitted = self.events_emitted(),
            delivery_failures = self.delivery_failures(),
            degraded_decisions = self.degraded_decisions(),
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for c in [
            &self.attempts_started,
            &self.retries,
            &self.escalations,
            &self.checkpoints_created,
            &self.events_emitted,
            &self.delivery_failures,
            &self.degraded_decisions,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}
