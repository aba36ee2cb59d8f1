//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the worker and provides
//! functions for initializing, registering, and exporting metrics.

use std::path::Path;

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all worker metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Claim attempts, labeled by result (claimed, none, conflict, error).
pub static CLAIMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Reclaim attempts, labeled by result (ok, lost, error).
pub static RECLAIMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Resolved runs, labeled by outcome and exception reason.
pub static RESOLUTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Runs whose claim was lost before resolution.
pub static CLAIMS_LOST: OnceLock<Counter> = OnceLock::new();

/// Internal faults raised by the engine or its sandboxes.
pub static INTERNAL_FAULTS: OnceLock<Counter> = OnceLock::new();

/// Sandboxes currently executing.
pub static SANDBOXES_EXECUTING: OnceLock<Gauge> = OnceLock::new();

/// Effective concurrency limit of the task manager.
pub static CAPACITY: OnceLock<Gauge> = OnceLock::new();

/// Run duration in seconds from claim to resolution, labeled by outcome.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Should be called once at startup. Recording before initialization is a
/// no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let claims_total = CounterVec::new(
        Opts::new("sandbox_worker_claims_total", "Claim attempts by result"),
        &["result"],
    )?;

    let reclaims_total = CounterVec::new(
        Opts::new("sandbox_worker_reclaims_total", "Reclaim attempts by result"),
        &["result"],
    )?;

    let resolutions_total = CounterVec::new(
        Opts::new(
            "sandbox_worker_resolutions_total",
            "Resolved task runs by outcome",
        ),
        &["outcome", "reason"],
    )?;

    let claims_lost = Counter::new(
        "sandbox_worker_claims_lost_total",
        "Task runs whose claim was lost before resolution",
    )?;

    let internal_faults = Counter::new(
        "sandbox_worker_internal_faults_total",
        "Internal faults raised by the engine",
    )?;

    let sandboxes_executing = Gauge::new(
        "sandbox_worker_sandboxes_executing",
        "Sandboxes currently executing",
    )?;

    let capacity = Gauge::new(
        "sandbox_worker_capacity",
        "Maximum number of concurrently executing sandboxes",
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "sandbox_worker_task_duration_seconds",
            "Task run duration from claim to resolution in seconds",
        )
        .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]),
        &["outcome"],
    )?;

    registry.register(Box::new(claims_total.clone()))?;
    registry.register(Box::new(reclaims_total.clone()))?;
    registry.register(Box::new(resolutions_total.clone()))?;
    registry.register(Box::new(claims_lost.clone()))?;
    registry.register(Box::new(internal_faults.clone()))?;
    registry.register(Box::new(sandboxes_executing.clone()))?;
    registry.register(Box::new(capacity.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;

    // Already-set cells mean metrics were initialized before; keep the first set.
    let _ = REGISTRY.set(registry);
    let _ = CLAIMS_TOTAL.set(claims_total);
    let _ = RECLAIMS_TOTAL.set(reclaims_total);
    let _ = RESOLUTIONS_TOTAL.set(resolutions_total);
    let _ = CLAIMS_LOST.set(claims_lost);
    let _ = INTERNAL_FAULTS.set(internal_faults);
    let _ = SANDBOXES_EXECUTING.set(sandboxes_executing);
    let _ = CAPACITY.set(capacity);
    let _ = TASK_DURATION.set(task_duration);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead if the registry has not been initialized
/// or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Writes the text exposition to `path`, for node-exporter style textfile collection.
pub async fn write_metrics(path: &Path) -> std::io::Result<()> {
    tokio::fs::write(path, export_metrics()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        // Global state: another test may have initialized first.
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        if REGISTRY.get().is_some() {
            assert!(!metrics.starts_with("# Error"));
        }
    }

    #[tokio::test]
    async fn test_write_metrics() {
        let _ = init_metrics();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.prom");
        write_metrics(&path).await.unwrap();
        assert!(path.exists());
    }
}
