//! # Metrics
//!
//! Counters, gauges and histograms go through the `metrics` facade. The
//! Prometheus recorder is installed once at startup and its handle renders
//! the scrape body for `/metrics`. Nothing here requires the recorder to be
//! installed; without one the macros are no-ops.
//!
//! The pull-based [`MetricsSnapshot`] is built from the registry, the capacity
//! tracker and the [`OutcomeCounters`], independent of the exporter.

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::config::MetricsConfig;
use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::{HealthState, RequestOutcome, SubstationId};

/// Per-outcome request counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub admitted: u64,
    pub rejected: u64,
    pub failed: u64,
    /// Requests currently being routed
    pub pending: u64,
}

impl OutcomeCounts {
    pub fn total_finished(&self) -> u64 {
        self.admitted + self.rejected + self.failed
    }
}

/// Lock-free outcome counters for the balancer
#[derive(Debug, Default)]
pub struct OutcomeCounters {
    admitted: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    pending: AtomicU64,
}

/// Marks one request as in flight until dropped
pub struct InFlight<'a> {
    counters: &'a OutcomeCounters,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let pending = self.counters.pending.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        gauge!("balancer_requests_in_flight").set(pending as f64);
    }
}

impl OutcomeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> InFlight<'_> {
        let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        gauge!("balancer_requests_in_flight").set(pending as f64);
        InFlight { counters: self }
    }

    pub fn record(&self, outcome: RequestOutcome) {
        let slot = match outcome {
            RequestOutcome::Admitted => &self.admitted,
            RequestOutcome::Rejected => &self.rejected,
            RequestOutcome::Failed => &self.failed,
            RequestOutcome::Pending => return,
        };
        slot.fetch_add(1, Ordering::Relaxed);
        counter!("balancer_requests_total", "outcome" => outcome.to_string()).increment(1);
    }

    pub fn snapshot(&self) -> OutcomeCounts {
        OutcomeCounts {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstationMetrics {
    pub substation_id: SubstationId,
    pub reserved: u64,
    pub max: u64,
    pub health: HealthState,
}

/// Monitoring snapshot: per-substation load and health plus request outcomes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub captured_at: DateTime<Utc>,
    pub substations: Vec<SubstationMetrics>,
    pub requests: OutcomeCounts,
}

/// Register descriptions for every metric the balancer emits
pub fn describe_metrics() {
    describe_counter!("balancer_requests_total", "Charge requests by final outcome");
    describe_gauge!("balancer_requests_in_flight", "Charge requests currently being routed");
    describe_histogram!(
        "balancer_assignment_duration_seconds",
        Unit::Seconds,
        "Time spent assigning a request to a substation"
    );
    describe_gauge!("substation_reserved", "Capacity currently reserved on a substation");
    describe_gauge!("substation_max_capacity", "Declared max capacity of a substation");
    describe_gauge!("substation_health", "Substation health (2 healthy, 1 degraded, 0 unreachable)");
    describe_counter!("charging_sessions_total", "Charging sessions by status");
    describe_histogram!(
        "charging_session_duration_seconds",
        Unit::Seconds,
        "Duration of finished charging sessions"
    );
}

/// Prometheus exporter whose handle renders the `/metrics` body
#[derive(Clone)]
pub struct MetricsExporter {
    handle: PrometheusHandle,
}

impl MetricsExporter {
    /// Install the global Prometheus recorder. Can only succeed once per process.
    pub fn install(config: &MetricsConfig) -> BalancerResult<Self> {
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full("balancer_assignment_duration_seconds".to_string()),
                &config.assignment_buckets,
            )
            .map_err(|e| BalancerError::config(format!("Invalid histogram buckets: {}", e)))?;

        let handle = builder
            .install_recorder()
            .map_err(|e| BalancerError::internal(format!("Failed to install metrics recorder: {}", e)))?;

        describe_metrics();
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_counters() {
        let counters = OutcomeCounters::new();
        {
            let _flight = counters.begin();
            assert_eq!(counters.snapshot().pending, 1);
            counters.record(RequestOutcome::Admitted);
        }
        counters.record(RequestOutcome::Rejected);
        counters.record(RequestOutcome::Pending);

        let counts = counters.snapshot();
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.admitted, 1);
        assert_eq!(counts.rejected, 1);
        assert_eq!(counts.total_finished(), 2);
    }
}
