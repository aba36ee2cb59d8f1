//! High-level recording interface over the raw Prometheus metrics.

use std::time::Duration;

use super::prometheus::{
    CAPACITY, CLAIMS_LOST, CLAIMS_TOTAL, INTERNAL_FAULTS, RECLAIMS_TOTAL, RESOLUTIONS_TOTAL,
    SANDBOXES_EXECUTING, TASK_DURATION,
};
use crate::queue::Outcome;

/// Metrics collector for recording worker operational metrics.
///
/// Every method is a no-op until `init_metrics()` has run, so components can
/// record unconditionally.
///
/// # Example
///
/// ```ignore
/// use sandbox_worker::metrics::{init_metrics, MetricsCollector};
/// use sandbox_worker::queue::Outcome;
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_claim("claimed");
/// collector.record_resolution(Outcome::Completed, Duration::from_secs(42));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record the result of one claim attempt.
    pub fn record_claim(&self, result: &str) {
        if let Some(claims) = CLAIMS_TOTAL.get() {
            claims.with_label_values(&[result]).inc();
        }
        tracing::trace!(result = result, "Recorded claim metric");
    }

    /// Record the result of one reclaim attempt.
    pub fn record_reclaim(&self, result: &str) {
        if let Some(reclaims) = RECLAIMS_TOTAL.get() {
            reclaims.with_label_values(&[result]).inc();
        }
    }

    /// Record a resolved run.
    ///
    /// # Arguments
    ///
    /// * `outcome` - Outcome reported to the queue
    /// * `duration` - Time from claim to resolution
    pub fn record_resolution(&self, outcome: Outcome, duration: Duration) {
        let reason = outcome.reason().map(|r| r.as_str()).unwrap_or("");

        if let Some(resolutions) = RESOLUTIONS_TOTAL.get() {
            resolutions
                .with_label_values(&[outcome.label(), reason])
                .inc();
        }

        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[outcome.label()])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(
            outcome = %outcome,
            duration_secs = duration.as_secs_f64(),
            "Recorded resolution metric"
        );
    }

    pub fn record_claim_lost(&self) {
        if let Some(lost) = CLAIMS_LOST.get() {
            lost.inc();
        }
    }

    pub fn record_internal_fault(&self) {
        if let Some(faults) = INTERNAL_FAULTS.get() {
            faults.inc();
        }
    }

    pub fn sandbox_started(&self) {
        if let Some(executing) = SANDBOXES_EXECUTING.get() {
            executing.inc();
        }
    }

    pub fn sandbox_finished(&self) {
        if let Some(executing) = SANDBOXES_EXECUTING.get() {
            executing.dec();
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        if let Some(gauge) = CAPACITY.get() {
            gauge.set(capacity as f64);
        }
    }
}
