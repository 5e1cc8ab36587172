//! Health State Machine
//!
//! Per-substation health driven by probe outcomes. The machine has three
//! states and is advanced one probe at a time:
//!
//! - **Healthy**: probes succeed; the substation is offered for selection
//! - **Degraded**: the last probe failed; not offered, still counting
//! - **Unreachable**: `failure_threshold` consecutive failures; excluded
//!   until `recovery_threshold` consecutive successes bring it back
//!
//! Reservations are never touched here. An unreachable substation keeps
//! whatever it holds until someone drains it.

use serde::{Deserialize, Serialize};

use crate::core::config::HealthConfig;
use crate::core::types::HealthState;

/// A state change produced by one probe outcome or a forced mark
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: HealthState,
    pub current: HealthState,
}

/// Counter snapshot for the status surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCounters {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

#[derive(Debug, Clone)]
pub struct HealthStateMachine {
    state: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    failure_threshold: u32,
    recovery_threshold: u32,
}

impl HealthStateMachine {
    /// New substations start out healthy
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            failure_threshold: config.failure_threshold.max(1),
            recovery_threshold: config.recovery_threshold.max(1),
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn counters(&self) -> HealthCounters {
        HealthCounters {
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
        }
    }

    /// Feed one probe outcome; returns the transition if the state changed
    pub fn record_probe(&mut self, success: bool) -> Option<Transition> {
        let next = if success {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);

            if self.state != HealthState::Healthy
                && self.consecutive_successes >= self.recovery_threshold
            {
                HealthState::Healthy
            } else {
                self.state
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);

            if self.consecutive_failures >= self.failure_threshold {
                HealthState::Unreachable
            } else if self.state == HealthState::Healthy {
                HealthState::Degraded
            } else {
                self.state
            }
        };

        self.move_to(next)
    }

    /// Operator or node override; resets the probe counters
    pub fn force(&mut self, state: HealthState) -> Option<Transition> {
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.move_to(state)
    }

    fn move_to(&mut self, next: HealthState) -> Option<Transition> {
        if next == self.state {
            return None;
        }
        let previous = self.state;
        self.state = next;
        Some(Transition {
            previous,
            current: next,
        })
    }
}
