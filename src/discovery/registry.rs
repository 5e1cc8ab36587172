//! # Substation Registry
//!
//! The live set of known substations, their declared capacity and their
//! probe-driven health. Membership is held in a `DashMap` that is never
//! exposed; callers get owned snapshots.
//!
//! Registration also creates the substation's counter in the shared
//! [`CapacityTracker`], so `list_healthy` can report `reserved` as read at
//! call time. Health transitions are published on a `tokio::sync::broadcast`
//! channel for monitoring.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::gauge;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::capacity::CapacityTracker;
use crate::core::config::HealthConfig;
use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::{HealthState, Substation, SubstationId, SubstationSnapshot};
use crate::discovery::health_state::{HealthStateMachine, Transition};

/// Published whenever a substation changes health state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub substation_id: SubstationId,
    pub previous: HealthState,
    pub current: HealthState,
    pub at: DateTime<Utc>,
}

/// Receiver for health transition events
pub type HealthEventReceiver = broadcast::Receiver<HealthEvent>;

struct RegistryEntry {
    substation: Substation,
    health: HealthStateMachine,
    last_probe: Option<DateTime<Utc>>,
}

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unreachable: usize,
}

pub struct SubstationRegistry {
    entries: DashMap<SubstationId, RegistryEntry>,
    capacity: Arc<CapacityTracker>,
    health_config: HealthConfig,
    events: broadcast::Sender<HealthEvent>,
}

impl SubstationRegistry {
    pub fn new(capacity: Arc<CapacityTracker>, health_config: HealthConfig) -> Self {
        let (events, _) = broadcast::channel(256);

        Self {
            entries: DashMap::new(),
            capacity,
            health_config,
            events,
        }
    }

    /// Add a substation. A duplicate identifier leaves membership unchanged.
    pub fn register(&self, substation: Substation) -> BalancerResult<()> {
        match self.entries.entry(substation.id.clone()) {
            Entry::Occupied(_) => {
                warn!(substation_id = %substation.id, "Rejected duplicate substation registration");
                Err(BalancerError::DuplicateId {
                    substation_id: substation.id,
                })
            }
            Entry::Vacant(slot) => {
                self.capacity.register(&substation.id, substation.max_capacity)?;

                gauge!("substation_health", "substation_id" => substation.id.clone())
                    .set(HealthState::Healthy.as_gauge());
                info!(
                    substation_id = %substation.id,
                    max_capacity = substation.max_capacity,
                    url = substation.url.as_deref().unwrap_or("in-process"),
                    "Registered substation"
                );

                slot.insert(RegistryEntry {
                    health: HealthStateMachine::new(&self.health_config),
                    substation,
                    last_probe: None,
                });
                Ok(())
            }
        }
    }

    /// Healthy substations ordered by identifier, with `reserved` read now
    pub fn list_healthy(&self) -> Vec<SubstationSnapshot> {
        self.list()
            .into_iter()
            .filter(|snapshot| snapshot.health.is_routable())
            .collect()
    }

    /// Every registered substation regardless of health, ordered by identifier
    pub fn list(&self) -> Vec<SubstationSnapshot> {
        let mut snapshots: Vec<SubstationSnapshot> = self
            .entries
            .iter()
            .filter_map(|entry| self.snapshot_of(entry.value()))
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub fn get(&self, substation_id: &str) -> BalancerResult<SubstationSnapshot> {
        let entry = self
            .entries
            .get(substation_id)
            .ok_or_else(|| BalancerError::unknown_substation(substation_id))?;
        self.snapshot_of(entry.value())
            .ok_or_else(|| BalancerError::unknown_substation(substation_id))
    }

    /// Declared substation, including its remote URL if any
    pub fn declaration(&self, substation_id: &str) -> BalancerResult<Substation> {
        self.entries
            .get(substation_id)
            .map(|entry| entry.substation.clone())
            .ok_or_else(|| BalancerError::unknown_substation(substation_id))
    }

    pub fn health(&self, substation_id: &str) -> BalancerResult<HealthState> {
        self.entries
            .get(substation_id)
            .map(|entry| entry.health.state())
            .ok_or_else(|| BalancerError::unknown_substation(substation_id))
    }

    /// Force a health state, bypassing probe counting
    pub fn mark_health(&self, substation_id: &str, state: HealthState) -> BalancerResult<()> {
        let transition = {
            let mut entry = self
                .entries
                .get_mut(substation_id)
                .ok_or_else(|| BalancerError::unknown_substation(substation_id))?;
            entry.health.force(state)
        };

        if let Some(transition) = transition {
            self.publish(substation_id, transition);
        }
        Ok(())
    }

    /// Feed one probe outcome into the substation's state machine
    pub fn record_probe(&self, substation_id: &str, success: bool) -> BalancerResult<HealthState> {
        let (transition, state) = {
            let mut entry = self
                .entries
                .get_mut(substation_id)
                .ok_or_else(|| BalancerError::unknown_substation(substation_id))?;
            entry.last_probe = Some(Utc::now());
            let transition = entry.health.record_probe(success);
            (transition, entry.health.state())
        };

        debug!(substation_id = %substation_id, success, state = %state, "Recorded health probe");

        if let Some(transition) = transition {
            self.publish(substation_id, transition);
        }
        Ok(state)
    }

    pub fn subscribe(&self) -> HealthEventReceiver {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.entries.iter() {
            stats.total += 1;
            match entry.health.state() {
                HealthState::Healthy => stats.healthy += 1,
                HealthState::Degraded => stats.degraded += 1,
                HealthState::Unreachable => stats.unreachable += 1,
            }
        }
        stats
    }

    fn snapshot_of(&self, entry: &RegistryEntry) -> Option<SubstationSnapshot> {
        let load = self.capacity.current_load(&entry.substation.id).ok()?;
        Some(SubstationSnapshot {
            id: entry.substation.id.clone(),
            max_capacity: load.max,
            reserved: load.reserved,
            health: entry.health.state(),
            last_probe: entry.last_probe,
            url: entry.substation.url.clone(),
            consecutive_failures: entry.health.counters().consecutive_failures,
        })
    }

    fn publish(&self, substation_id: &str, transition: Transition) {
        gauge!("substation_health", "substation_id" => substation_id.to_string())
            .set(transition.current.as_gauge());

        match transition.current {
            HealthState::Healthy => info!(
                substation_id = %substation_id,
                previous = %transition.previous,
                "Substation is healthy"
            ),
            _ => warn!(
                substation_id = %substation_id,
                previous = %transition.previous,
                current = %transition.current,
                "Substation health changed"
            ),
        }

        // No subscribers is fine
        let _ = self.events.send(HealthEvent {
            substation_id: substation_id.to_string(),
            previous: transition.previous,
            current: transition.current,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SubstationRegistry {
        SubstationRegistry::new(Arc::new(CapacityTracker::new()), HealthConfig::default())
    }

    #[test]
    fn test_duplicate_registration_leaves_membership_unchanged() {
        let registry = registry();
        registry.register(Substation::new("s1", 10)).unwrap();

        let err = registry.register(Substation::new("s1", 99)).unwrap_err();
        assert_eq!(err, BalancerError::DuplicateId { substation_id: "s1".to_string() });
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("s1").unwrap().max_capacity, 10);
    }

    #[test]
    fn test_list_healthy_is_ordered_and_filtered() {
        let registry = registry();
        registry.register(Substation::new("substation3", 100)).unwrap();
        registry.register(Substation::new("substation1", 150)).unwrap();
        registry.register(Substation::new("substation2", 120)).unwrap();
        registry.mark_health("substation2", HealthState::Degraded).unwrap();

        let ids: Vec<String> = registry.list_healthy().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["substation1", "substation3"]);
        assert_eq!(registry.list().len(), 3);
    }

    #[test]
    fn test_list_healthy_reads_reserved_at_call_time() {
        let capacity = Arc::new(CapacityTracker::new());
        let registry = SubstationRegistry::new(capacity.clone(), HealthConfig::default());
        registry.register(Substation::new("s1", 10)).unwrap();

        capacity.try_reserve("s1", 7).unwrap();
        assert_eq!(registry.list_healthy()[0].reserved, 7);
    }

    #[tokio::test]
    async fn test_transitions_are_broadcast() {
        let registry = registry();
        registry.register(Substation::new("s1", 10)).unwrap();
        let mut events = registry.subscribe();

        registry.record_probe("s1", false).unwrap();
        registry.record_probe("s1", false).unwrap();
        registry.record_probe("s1", false).unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!((first.previous, first.current), (HealthState::Healthy, HealthState::Degraded));
        let second = events.recv().await.unwrap();
        assert_eq!(second.current, HealthState::Unreachable);
        assert_eq!(registry.stats().unreachable, 1);
    }

    #[test]
    fn test_unknown_substation() {
        let registry = registry();
        assert!(matches!(registry.health("ghost"), Err(BalancerError::UnknownSubstation { .. })));
        assert!(registry.record_probe("ghost", true).is_err());
    }
}
