//! # Substation Balancer - Core Library Crate
//!
//! Admission control and least-loaded routing of EV charge requests across a
//! fleet of power substations. Each substation declares a max capacity; the
//! balancer guarantees that the capacity reserved on a substation never
//! exceeds it, no matter how many requests arrive at once.
//!
//! ## Module Layout
//!
//! - `core`: error type, configuration and shared data structures
//! - `capacity`: per-substation atomic reservation counters
//! - `discovery`: substation registry and the health state machine
//! - `load_balancing`: ranking strategy and the routing/admission core
//! - `substation`: session handling, in-process or against a remote service
//! - `observability`: logging, metrics and health probing
//! - `gateway`: the balancer's own HTTP surface

/// Error types, configuration and core data structures
pub mod core;

/// Linearizable capacity reservation
pub mod capacity;

/// Substation membership and health
pub mod discovery;

/// Candidate ranking and request routing
pub mod load_balancing;

/// Charge session handling per substation
pub mod substation;

/// Logging, metrics and health monitoring
pub mod observability;

/// HTTP server and handlers
pub mod gateway;

pub use crate::core::config::BalancerConfig;
pub use crate::core::error::{BalancerError, BalancerResult};
pub use crate::core::types::{
    Admission, ChargeRequest, GatewayDecision, HealthState, RequestOutcome, Substation,
    SubstationSnapshot,
};

pub use crate::capacity::{CapacityTracker, Reservation, ReservationId};
pub use crate::discovery::SubstationRegistry;
pub use crate::gateway::{BalancerServer, ServerState};
pub use crate::load_balancing::{ChargeBalancer, LeastLoaded, RankingStrategy};
pub use crate::substation::{HttpSubstationNode, LocalSubstation, SubstationNode};
