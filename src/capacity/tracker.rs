//! # Capacity Tracker
//!
//! Per-substation reserved-capacity counters and the reservation handles
//! issued against them. This is the source of truth for admission.
//!
//! Each substation owns one `AtomicU64`. `try_reserve` performs the capacity
//! check and the increment in a single `fetch_update`, so two concurrent
//! callers can never both squeeze past `max` even when each saw enough room
//! when it ranked candidates. Counters of different substations never
//! contend with each other.
//!
//! Every successful reservation is recorded in a live set keyed by
//! [`ReservationId`]. `release` removes the entry before touching the counter:
//! whichever caller wins the removal performs the single decrement, and
//! everyone else gets `AlreadyReleased`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::gauge;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::SubstationId;

/// Opaque identifier of one reservation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId(String);

impl ReservationId {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle proving that `amount` units are held on `substation_id`.
///
/// The handle is consumed exactly once by [`CapacityTracker::release`];
/// releasing a clone of an already released handle is reported, not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub substation_id: SubstationId,
    pub amount: u64,
    pub reserved_at: DateTime<Utc>,
}

/// Instantaneous `(reserved, max)` pair for one substation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub reserved: u64,
    pub max: u64,
}

impl LoadSnapshot {
    pub fn available(&self) -> u64 {
        self.max.saturating_sub(self.reserved)
    }
}

struct CapacityCell {
    max: u64,
    reserved: AtomicU64,
}

/// Publish the counter's current value
fn publish_reserved(substation_id: &str, cell: &CapacityCell) {
    let reserved = cell.reserved.load(Ordering::Acquire);
    gauge!("substation_reserved", "substation_id" => substation_id.to_string()).set(reserved as f64);
}

/// Linearizable admission control, one counter per substation
#[derive(Default)]
pub struct CapacityTracker {
    cells: DashMap<SubstationId, Arc<CapacityCell>>,
    live: DashMap<ReservationId, Reservation>,
}

impl CapacityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the counter for a newly registered substation
    pub fn register(&self, substation_id: &str, max: u64) -> BalancerResult<()> {
        if max == 0 {
            return Err(BalancerError::config(format!(
                "Substation '{}' must declare a positive max capacity",
                substation_id
            )));
        }

        match self.cells.entry(substation_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BalancerError::DuplicateId {
                substation_id: substation_id.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(CapacityCell {
                    max,
                    reserved: AtomicU64::new(0),
                }));
                gauge!("substation_max_capacity", "substation_id" => substation_id.to_string()).set(max as f64);
                gauge!("substation_reserved", "substation_id" => substation_id.to_string()).set(0.0);
                Ok(())
            }
        }
    }

    fn cell(&self, substation_id: &str) -> BalancerResult<Arc<CapacityCell>> {
        // Clone the Arc out so the shard lock is not held across the update
        self.cells
            .get(substation_id)
            .map(|cell| cell.clone())
            .ok_or_else(|| BalancerError::unknown_substation(substation_id))
    }

    /// Atomically check `reserved + amount <= max` and claim `amount`.
    ///
    /// On failure nothing changes and `CapacityExceeded` reports the load
    /// observed by the failed attempt.
    pub fn try_reserve(&self, substation_id: &str, amount: u64) -> BalancerResult<Reservation> {
        if amount == 0 {
            return Err(BalancerError::InvalidAmount { amount });
        }

        let cell = self.cell(substation_id)?;
        let max = cell.max;

        let previous = cell
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                reserved.checked_add(amount).filter(|next| *next <= max)
            })
            .map_err(|reserved| BalancerError::CapacityExceeded {
                substation_id: substation_id.to_string(),
                requested: amount,
                reserved,
                max,
            })?;

        let reservation = Reservation {
            id: ReservationId::generate(),
            substation_id: substation_id.to_string(),
            amount,
            reserved_at: Utc::now(),
        };
        self.live.insert(reservation.id.clone(), reservation.clone());

        let reserved = previous + amount;
        publish_reserved(substation_id, &cell);
        debug!(
            substation_id = %substation_id,
            reservation_id = %reservation.id,
            amount,
            reserved,
            max,
            "Reserved capacity"
        );

        Ok(reservation)
    }

    /// Return a reservation's capacity, exactly once.
    pub fn release(&self, reservation: &Reservation) -> BalancerResult<()> {
        let Some((_, held)) = self.live.remove(&reservation.id) else {
            warn!(
                reservation_id = %reservation.id,
                substation_id = %reservation.substation_id,
                "Release of a reservation that is no longer live"
            );
            return Err(BalancerError::AlreadyReleased {
                reservation_id: reservation.id.to_string(),
            });
        };

        let cell = self.cell(&held.substation_id)?;
        let remaining = cell
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                reserved.checked_sub(held.amount)
            })
            .map(|previous| previous - held.amount)
            .map_err(|reserved| {
                error!(
                    substation_id = %held.substation_id,
                    reserved,
                    amount = held.amount,
                    "Reserved counter would underflow"
                );
                BalancerError::internal(format!(
                    "reserved counter for '{}' would underflow ({} - {})",
                    held.substation_id, reserved, held.amount
                ))
            })?;

        publish_reserved(&held.substation_id, &cell);
        debug!(
            substation_id = %held.substation_id,
            reservation_id = %held.id,
            amount = held.amount,
            reserved = remaining,
            "Released capacity"
        );

        Ok(())
    }

    /// Instantaneous `(reserved, max)`; may be stale by the time it is used
    pub fn current_load(&self, substation_id: &str) -> BalancerResult<LoadSnapshot> {
        let cell = self.cell(substation_id)?;
        Ok(LoadSnapshot {
            reserved: cell.reserved.load(Ordering::Acquire),
            max: cell.max,
        })
    }

    pub fn is_live(&self, reservation_id: &ReservationId) -> bool {
        self.live.contains_key(reservation_id)
    }

    /// All reservations still held on one substation
    pub fn live_reservations(&self, substation_id: &str) -> BalancerResult<Vec<Reservation>> {
        if !self.cells.contains_key(substation_id) {
            return Err(BalancerError::unknown_substation(substation_id));
        }

        let mut reservations: Vec<Reservation> = self
            .live
            .iter()
            .filter(|entry| entry.value().substation_id == substation_id)
            .map(|entry| entry.value().clone())
            .collect();
        reservations.sort_by(|a, b| a.reserved_at.cmp(&b.reserved_at));
        Ok(reservations)
    }

    /// Number of reservations held across all substations
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    fn tracker_with(substation_id: &str, max: u64) -> CapacityTracker {
        let tracker = CapacityTracker::new();
        tracker.register(substation_id, max).unwrap();
        tracker
    }

    #[test]
    fn test_reserve_and_release() {
        let tracker = tracker_with("s1", 10);

        let reservation = tracker.try_reserve("s1", 4).unwrap();
        assert_eq!(tracker.current_load("s1").unwrap(), LoadSnapshot { reserved: 4, max: 10 });
        assert!(tracker.is_live(&reservation.id));

        tracker.release(&reservation).unwrap();
        assert_eq!(tracker.current_load("s1").unwrap().reserved, 0);
        assert!(!tracker.is_live(&reservation.id));
    }

    #[test]
    fn test_reserve_up_to_exact_capacity() {
        let tracker = tracker_with("s1", 10);
        tracker.try_reserve("s1", 6).unwrap();
        tracker.try_reserve("s1", 4).unwrap();

        let err = tracker.try_reserve("s1", 1).unwrap_err();
        assert_eq!(
            err,
            BalancerError::CapacityExceeded {
                substation_id: "s1".to_string(),
                requested: 1,
                reserved: 10,
                max: 10,
            }
        );
        assert_eq!(tracker.current_load("s1").unwrap().reserved, 10);
    }

    #[test]
    fn test_double_release_is_rejected() {
        let tracker = tracker_with("s1", 10);
        let reservation = tracker.try_reserve("s1", 3).unwrap();

        tracker.release(&reservation).unwrap();
        let err = tracker.release(&reservation).unwrap_err();
        assert!(matches!(err, BalancerError::AlreadyReleased { .. }));
        assert_eq!(tracker.current_load("s1").unwrap().reserved, 0);
    }

    #[test]
    fn test_zero_amount_rejected_without_side_effects() {
        let tracker = tracker_with("s1", 10);
        assert_eq!(tracker.try_reserve("s1", 0), Err(BalancerError::InvalidAmount { amount: 0 }));
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_unknown_substation() {
        let tracker = CapacityTracker::new();
        assert!(matches!(
            tracker.try_reserve("ghost", 1),
            Err(BalancerError::UnknownSubstation { .. })
        ));
        assert!(tracker.current_load("ghost").is_err());
    }

    #[test]
    fn test_duplicate_registration() {
        let tracker = tracker_with("s1", 10);
        assert!(matches!(tracker.register("s1", 20), Err(BalancerError::DuplicateId { .. })));
        assert_eq!(tracker.current_load("s1").unwrap().max, 10);
    }

    #[test]
    fn test_live_reservations_are_scoped_per_substation() {
        let tracker = CapacityTracker::new();
        tracker.register("a", 10).unwrap();
        tracker.register("b", 10).unwrap();
        tracker.try_reserve("a", 1).unwrap();
        tracker.try_reserve("a", 2).unwrap();
        tracker.try_reserve("b", 3).unwrap();

        let on_a = tracker.live_reservations("a").unwrap();
        assert_eq!(on_a.len(), 2);
        assert_eq!(on_a.iter().map(|r| r.amount).sum::<u64>(), 3);
        assert_eq!(tracker.live_count(), 3);
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_max() {
        let tracker = Arc::new(tracker_with("s1", 100));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let tracker = tracker.clone();
            handles.push(std::thread::spawn(move || {
                let mut admitted = Vec::new();
                for _ in 0..50 {
                    if let Ok(reservation) = tracker.try_reserve("s1", 1) {
                        admitted.push(reservation);
                    }
                }
                admitted
            }));
        }

        let admitted: Vec<Reservation> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();

        assert_eq!(admitted.len(), 100);
        assert_eq!(tracker.current_load("s1").unwrap().reserved, 100);
    }

    #[test]
    fn test_reserved_gauge_follows_counter() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            let tracker = tracker_with("s1", 10);
            let first = tracker.try_reserve("s1", 4).unwrap();
            let _second = tracker.try_reserve("s1", 3).unwrap();
            tracker.release(&first).unwrap();
            assert!(tracker.release(&first).is_err());
        });

        let rendered = handle.render();
        assert!(
            rendered.contains("substation_reserved{substation_id=\"s1\"} 3"),
            "{}",
            rendered
        );
    }
}
