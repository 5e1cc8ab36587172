pub mod tracker;

pub use tracker::{CapacityTracker, LoadSnapshot, Reservation, ReservationId};
