pub mod health_state;
pub mod registry;

pub use health_state::{HealthCounters, HealthStateMachine, Transition};
pub use registry::{HealthEvent, HealthEventReceiver, RegistryStats, SubstationRegistry};
