//! # Core Types Module
//!
//! Data structures shared by the registry, the capacity tracker, the balancer
//! and the substation nodes. Everything here is plain owned data with serde
//! derives so it can be returned from the API surface unchanged.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::core::error::{BalancerError, BalancerResult};

/// Stable, unique substation identifier
pub type SubstationId = String;

/// Probe-driven health of a substation.
///
/// Only `Healthy` substations are offered to the selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Probes succeed; eligible for new reservations
    Healthy,
    /// At least one recent probe failed; not offered for selection
    Degraded,
    /// Failure threshold reached; excluded until a probe succeeds
    Unreachable,
}

impl HealthState {
    /// Whether new charge requests may be routed here
    pub fn is_routable(&self) -> bool {
        matches!(self, HealthState::Healthy)
    }

    /// Numeric encoding used by the `substation_health` gauge
    pub fn as_gauge(&self) -> f64 {
        match self {
            HealthState::Healthy => 2.0,
            HealthState::Degraded => 1.0,
            HealthState::Unreachable => 0.0,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Substation declaration handed to the registry at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Substation {
    pub id: SubstationId,
    /// Declared max capacity (power units or concurrent slots)
    pub max_capacity: u64,
    /// Base URL of a remote substation service, if any
    pub url: Option<String>,
}

impl Substation {
    pub fn new(id: impl Into<SubstationId>, max_capacity: u64) -> Self {
        Self {
            id: id.into(),
            max_capacity,
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Point-in-time view of one substation, combining registry and tracker state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstationSnapshot {
    pub id: SubstationId,
    pub max_capacity: u64,
    pub reserved: u64,
    pub health: HealthState,
    pub last_probe: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub consecutive_failures: u32,
}

impl SubstationSnapshot {
    /// Remaining capacity at snapshot time
    pub fn available(&self) -> u64 {
        self.max_capacity.saturating_sub(self.reserved)
    }

    /// `reserved / max`, for display; ranking compares exact fractions instead
    pub fn load_ratio(&self) -> f64 {
        if self.max_capacity == 0 {
            return 1.0;
        }
        self.reserved as f64 / self.max_capacity as f64
    }

    pub fn utilization_percent(&self) -> f64 {
        self.load_ratio() * 100.0
    }
}

/// Lifecycle outcome of a charge request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Pending,
    Admitted,
    Rejected,
    Failed,
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Pending => write!(f, "pending"),
            RequestOutcome::Admitted => write!(f, "admitted"),
            RequestOutcome::Rejected => write!(f, "rejected"),
            RequestOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// A charge request as handed over by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub id: String,
    pub vehicle_id: String,
    /// Requested power, in the same unit as substation capacity
    pub amount: u64,
    /// Requested session length in seconds; `0` keeps the session open until ended
    pub duration_secs: u64,
    pub arrived_at: DateTime<Utc>,
    pub assigned_substation: Option<SubstationId>,
    pub outcome: RequestOutcome,
}

impl ChargeRequest {
    pub fn new(
        id: impl Into<String>,
        vehicle_id: impl Into<String>,
        amount: u64,
        duration_secs: u64,
    ) -> Self {
        Self {
            id: id.into(),
            vehicle_id: vehicle_id.into(),
            amount,
            duration_secs,
            arrived_at: Utc::now(),
            assigned_substation: None,
            outcome: RequestOutcome::Pending,
        }
    }

    /// Build a request with a freshly generated identifier
    pub fn generate(vehicle_id: impl Into<String>, amount: u64, duration_secs: u64) -> Self {
        Self::new(Uuid::new_v4().to_string(), vehicle_id, amount, duration_secs)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Reject inputs the core cannot route
    pub fn validate(&self) -> BalancerResult<()> {
        if self.id.trim().is_empty() {
            return Err(BalancerError::invalid_request("request_id", "must not be empty"));
        }
        if self.amount == 0 {
            return Err(BalancerError::InvalidAmount { amount: self.amount });
        }
        Ok(())
    }

    /// Estimated completion time, when the session has a fixed length
    pub fn estimated_completion(&self, started_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.duration_secs == 0 {
            return None;
        }
        let secs = i64::try_from(self.duration_secs).ok()?;
        started_at.checked_add_signed(ChronoDuration::seconds(secs))
    }
}

/// Successful routing result for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Admission {
    pub request_id: String,
    pub substation_id: SubstationId,
    pub session_id: String,
    pub reservation_id: String,
    pub amount: u64,
    /// Hand-off attempts used, starting at 1
    pub attempts: u32,
    /// Reserved amount on the chosen substation before this admission
    pub load_before: u64,
    pub max_capacity: u64,
    pub estimated_completion: Option<DateTime<Utc>>,
}

/// The gateway-facing answer: admitted somewhere, or rejected with a reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GatewayDecision {
    Admitted { substation_id: SubstationId },
    Rejected { reason: String, retryable: bool },
}

impl From<&BalancerResult<Admission>> for GatewayDecision {
    fn from(result: &BalancerResult<Admission>) -> Self {
        match result {
            Ok(admission) => GatewayDecision::Admitted {
                substation_id: admission.substation_id.clone(),
            },
            Err(err) => GatewayDecision::Rejected {
                reason: err.error_type().to_string(),
                retryable: err.is_retryable(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_healthy_is_routable() {
        assert!(HealthState::Healthy.is_routable());
        assert!(!HealthState::Degraded.is_routable());
        assert!(!HealthState::Unreachable.is_routable());
    }

    #[test]
    fn test_snapshot_ratio_and_available() {
        let snapshot = SubstationSnapshot {
            id: "substation1".to_string(),
            max_capacity: 150,
            reserved: 30,
            health: HealthState::Healthy,
            last_probe: None,
            url: None,
            consecutive_failures: 0,
        };
        assert_eq!(snapshot.available(), 120);
        assert!((snapshot.load_ratio() - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_request_validation() {
        assert!(ChargeRequest::new("r1", "ev-1", 10, 60).validate().is_ok());
        assert_eq!(
            ChargeRequest::new("r1", "ev-1", 0, 60).validate(),
            Err(BalancerError::InvalidAmount { amount: 0 })
        );
        assert!(ChargeRequest::new(" ", "ev-1", 5, 60).validate().is_err());
    }

    #[test]
    fn test_estimated_completion() {
        let request = ChargeRequest::new("r1", "ev-1", 10, 90);
        let start = Utc::now();
        assert_eq!(request.estimated_completion(start), Some(start + ChronoDuration::seconds(90)));
        assert_eq!(ChargeRequest::new("r2", "ev-1", 10, 0).estimated_completion(start), None);
    }

    #[test]
    fn test_gateway_decision_from_result() {
        let rejected: BalancerResult<Admission> = Err(BalancerError::NoBackendAvailable);
        assert_eq!(
            GatewayDecision::from(&rejected),
            GatewayDecision::Rejected { reason: "no_backend_available".to_string(), retryable: true }
        );
    }
}
