//! # Observability
//!
//! Logging, metrics and substation health monitoring.

pub mod health;
pub mod logging;
pub mod metrics;

pub use self::health::{HealthMonitor, HealthProbe, HttpHealthProbe, ProbeResult};
pub use self::logging::init_logging;
pub use self::metrics::{
    describe_metrics, MetricsExporter, MetricsSnapshot, OutcomeCounters, OutcomeCounts,
    SubstationMetrics,
};
