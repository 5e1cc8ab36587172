pub mod balancer;
pub mod records;
pub mod strategies;

pub use balancer::{ChargeBalancer, DrainReport, PendingReservation, SystemStatus};
pub use records::{RequestListing, RequestRecord};
pub use strategies::{LeastLoaded, RankingStrategy};
