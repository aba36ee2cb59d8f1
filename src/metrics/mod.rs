//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks claims, reclaims, resolutions, internal faults and the number of
//! executing sandboxes.
//!
//! # Example
//!
//! ```ignore
//! use sandbox_worker::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! let collector = MetricsCollector::new();
//! collector.record_claim("claimed");
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, write_metrics};

pub use prometheus::{
    CAPACITY, CLAIMS_LOST, CLAIMS_TOTAL, INTERNAL_FAULTS, RECLAIMS_TOTAL, REGISTRY,
    RESOLUTIONS_TOTAL, SANDBOXES_EXECUTING, TASK_DURATION,
};
