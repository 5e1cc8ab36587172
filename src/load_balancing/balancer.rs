//! # Charge Balancer
//!
//! Least-loaded-first admission with capacity gating. For each request:
//!
//! 1. take the healthy substations from the registry, minus any excluded in
//!    earlier attempts; none at all means `NoBackendAvailable`
//! 2. rank them with the [`RankingStrategy`] (ascending `reserved / max`)
//! 3. call `try_reserve` on each in rank order; the first success wins
//! 4. if every candidate refuses, fail with `AllBackendsSaturated`
//! 5. hand the reservation to the substation's node; if the substation went
//!    unreachable or the node fails or times out, roll the reservation back,
//!    exclude the substation and start again from step 1, up to
//!    `max_attempts` before `RoutingFailed`
//!
//! Ranking reads snapshots that may already be stale. Only the atomic
//! check-and-increment in the [`CapacityTracker`] decides admission, so a
//! stale ranking at worst costs an extra `try_reserve` call.
//!
//! Between reservation and node acknowledgement the reservation is held by a
//! [`PendingReservation`]. If the routing future is dropped there, the guard
//! gives the capacity back. Health is checked again once the node has
//! acknowledged: a substation marked unreachable while the session was
//! starting has that session cancelled and the request moves on.
//!
//! Admitted requests are tracked until their reservation is released. Finished
//! records are retired when read, when their request id is routed again, and
//! by the sweep started with [`ChargeBalancer::spawn_reconciler`].

use chrono::Utc;
use dashmap::DashMap;
use metrics::histogram;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::capacity::{CapacityTracker, Reservation};
use crate::core::config::{BalancerConfig, RoutingConfig, SessionConfig};
use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::{
    Admission, ChargeRequest, GatewayDecision, HealthState, RequestOutcome, SubstationId,
    SubstationSnapshot,
};
use crate::discovery::SubstationRegistry;
use crate::load_balancing::records::{RequestBook, RequestListing, RequestRecord};
use crate::load_balancing::strategies::{LeastLoaded, RankingStrategy};
use crate::observability::metrics::{MetricsSnapshot, OutcomeCounters, OutcomeCounts, SubstationMetrics};
use crate::substation::{
    HttpSubstationNode, LocalSubstation, SessionEnd, SessionStatus, SubstationNode,
};

/// A reservation that has not yet been acknowledged by a node.
///
/// Dropping it without `commit` releases the capacity.
pub struct PendingReservation {
    capacity: Arc<CapacityTracker>,
    reservation: Reservation,
    armed: bool,
}

impl PendingReservation {
    pub fn new(capacity: Arc<CapacityTracker>, reservation: Reservation) -> Self {
        Self {
            capacity,
            reservation,
            armed: true,
        }
    }

    pub fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    /// The node acknowledged the session; ownership moves to the node
    pub fn commit(mut self) -> Reservation {
        self.armed = false;
        self.reservation.clone()
    }

    /// Give the capacity back now
    pub fn rollback(mut self) {
        self.armed = false;
        self.release();
    }

    fn release(&self) {
        match self.capacity.release(&self.reservation) {
            Ok(()) => debug!(
                substation_id = %self.reservation.substation_id,
                reservation_id = %self.reservation.id,
                "Rolled back reservation"
            ),
            Err(e) => warn!(
                substation_id = %self.reservation.substation_id,
                reservation_id = %self.reservation.id,
                error = %e,
                "Rollback found reservation already released"
            ),
        }
    }
}

impl Drop for PendingReservation {
    fn drop(&mut self) {
        if self.armed {
            self.release();
        }
    }
}

/// Result of force-ending everything held on one substation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub substation_id: SubstationId,
    /// Sessions ended with status `drained`
    pub sessions_ended: usize,
    /// Live reservations no session held, released directly
    pub orphans_released: usize,
    pub capacity_released: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub substations: Vec<SubstationSnapshot>,
    pub total_substations: usize,
    pub healthy_substations: usize,
    pub active_requests: usize,
    pub requests: OutcomeCounts,
    pub strategy: String,
    pub uptime_secs: i64,
}

pub struct ChargeBalancer {
    registry: Arc<SubstationRegistry>,
    capacity: Arc<CapacityTracker>,
    nodes: DashMap<SubstationId, Arc<dyn SubstationNode>>,
    strategy: Arc<dyn RankingStrategy>,
    routing: RoutingConfig,
    sessions: SessionConfig,
    records: RequestBook,
    outcomes: OutcomeCounters,
    started_at: chrono::DateTime<Utc>,
}

impl ChargeBalancer {
    pub fn new(
        registry: Arc<SubstationRegistry>,
        capacity: Arc<CapacityTracker>,
        routing: RoutingConfig,
        sessions: SessionConfig,
    ) -> Self {
        Self {
            registry,
            capacity,
            nodes: DashMap::new(),
            strategy: Arc::new(LeastLoaded::new()),
            routing,
            sessions,
            records: RequestBook::new(sessions.request_history_limit),
            outcomes: OutcomeCounters::new(),
            started_at: Utc::now(),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn RankingStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Build the balancer, register every configured substation and attach
    /// an in-process or HTTP node to each.
    pub fn from_config(config: &BalancerConfig) -> BalancerResult<Arc<Self>> {
        let capacity = Arc::new(CapacityTracker::new());
        let registry = Arc::new(SubstationRegistry::new(capacity.clone(), config.health));
        let balancer = Self::new(registry.clone(), capacity.clone(), config.routing, config.sessions);

        for substation in config.substation_declarations() {
            registry.register(substation.clone())?;

            let node: Arc<dyn SubstationNode> = match &substation.url {
                Some(url) => Arc::new(HttpSubstationNode::new(
                    substation.id.clone(),
                    url.clone(),
                    capacity.clone(),
                    config.routing.session_start_timeout,
                    config.sessions.poll_interval,
                    config.sessions.history_limit,
                )?),
                None => Arc::new(LocalSubstation::new(
                    substation.id.clone(),
                    capacity.clone(),
                    config.sessions.history_limit,
                )),
            };
            balancer.attach_node(node)?;
        }

        info!(
            substations = registry.len(),
            max_attempts = config.routing.max_attempts,
            strategy = balancer.strategy.name(),
            "Charge balancer initialized"
        );
        Ok(Arc::new(balancer))
    }

    /// Register an in-process substation and attach its node
    pub fn register_local(&self, substation_id: &str, max_capacity: u64) -> BalancerResult<Arc<LocalSubstation>> {
        self.registry
            .register(crate::core::types::Substation::new(substation_id, max_capacity))?;
        let node = Arc::new(LocalSubstation::new(
            substation_id,
            self.capacity.clone(),
            self.sessions.history_limit,
        ));
        self.attach_node(node.clone())?;
        Ok(node)
    }

    /// Attach the session handler for a registered substation
    pub fn attach_node(&self, node: Arc<dyn SubstationNode>) -> BalancerResult<()> {
        let substation_id = node.substation_id().to_string();
        self.registry.get(&substation_id)?;

        if self.nodes.insert(substation_id.clone(), node).is_some() {
            warn!(substation_id = %substation_id, "Replaced session handler");
        }
        Ok(())
    }

    pub fn registry(&self) -> &Arc<SubstationRegistry> {
        &self.registry
    }

    pub fn capacity(&self) -> &Arc<CapacityTracker> {
        &self.capacity
    }

    pub fn node(&self, substation_id: &str) -> Option<Arc<dyn SubstationNode>> {
        self.nodes.get(substation_id).map(|node| node.clone())
    }

    /// Route one charge request to a substation
    #[instrument(
        skip(self, request),
        fields(request_id = %request.id, amount = request.amount)
    )]
    pub async fn route(&self, request: ChargeRequest) -> BalancerResult<Admission> {
        let started = Instant::now();
        let _in_flight = self.outcomes.begin();

        let result = self.route_inner(&request).await;

        let outcome = match &result {
            Ok(_) => RequestOutcome::Admitted,
            Err(e) => e.outcome(),
        };
        self.outcomes.record(outcome);
        histogram!("balancer_assignment_duration_seconds").record(started.elapsed().as_secs_f64());

        match &result {
            Ok(admission) => info!(
                substation_id = %admission.substation_id,
                session_id = %admission.session_id,
                attempts = admission.attempts,
                "Request admitted"
            ),
            Err(e) => warn!(error = %e, outcome = %outcome, "Request not admitted"),
        }
        result
    }

    /// Gateway-facing form of [`route`](Self::route)
    pub async fn decide(&self, request: ChargeRequest) -> GatewayDecision {
        GatewayDecision::from(&self.route(request).await)
    }

    async fn route_inner(&self, request: &ChargeRequest) -> BalancerResult<Admission> {
        request.validate()?;
        self.retire_if_finished(&request.id);
        let _claim = self.records.claim(&request.id)?;

        let max_attempts = self.routing.max_attempts.max(1);
        let mut excluded: HashSet<SubstationId> = HashSet::new();
        let mut last_failure = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            let candidates: Vec<SubstationSnapshot> = self
                .registry
                .list_healthy()
                .into_iter()
                .filter(|snapshot| !excluded.contains(&snapshot.id))
                .collect();

            if candidates.is_empty() {
                if excluded.is_empty() {
                    return Err(BalancerError::NoBackendAvailable);
                }
                return Err(BalancerError::RoutingFailed {
                    attempts: attempt - 1,
                    reason: last_failure,
                });
            }

            let ranked = self.strategy.rank(candidates);
            let (pending, chosen) = self.reserve_first(&ranked, request.amount)?;

            match self.hand_off(request, pending, &chosen, attempt).await {
                Ok(admission) => return Ok(admission),
                Err(e) => {
                    warn!(
                        substation_id = %chosen.id,
                        attempt,
                        error = %e,
                        "Hand-off failed, excluding substation"
                    );
                    excluded.insert(chosen.id);
                    last_failure = e.to_string();
                }
            }
        }

        Err(BalancerError::RoutingFailed {
            attempts: max_attempts,
            reason: last_failure,
        })
    }

    /// First successful `try_reserve` in rank order
    fn reserve_first(
        &self,
        ranked: &[SubstationSnapshot],
        amount: u64,
    ) -> BalancerResult<(PendingReservation, SubstationSnapshot)> {
        for candidate in ranked {
            match self.capacity.try_reserve(&candidate.id, amount) {
                Ok(reservation) => {
                    let mut chosen = candidate.clone();
                    // load right before this reservation, not the ranking snapshot
                    chosen.reserved = self
                        .capacity
                        .current_load(&candidate.id)
                        .map(|load| load.reserved.saturating_sub(amount))
                        .unwrap_or(candidate.reserved);
                    return Ok((PendingReservation::new(self.capacity.clone(), reservation), chosen));
                }
                Err(BalancerError::CapacityExceeded { reserved, max, .. }) => {
                    debug!(
                        substation_id = %candidate.id,
                        reserved,
                        max,
                        amount,
                        "Candidate saturated, trying next"
                    );
                }
                Err(BalancerError::UnknownSubstation { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(BalancerError::AllBackendsSaturated {
            requested: amount,
            candidates: ranked.len(),
        })
    }

    async fn hand_off(
        &self,
        request: &ChargeRequest,
        pending: PendingReservation,
        chosen: &SubstationSnapshot,
        attempt: u32,
    ) -> BalancerResult<Admission> {
        if self.registry.health(&chosen.id)? == HealthState::Unreachable {
            pending.rollback();
            return Err(BalancerError::node_unavailable(
                &chosen.id,
                "became unreachable before hand-off",
            ));
        }

        let Some(node) = self.node(&chosen.id) else {
            pending.rollback();
            return Err(BalancerError::node_unavailable(&chosen.id, "no session handler attached"));
        };

        let timeout = self.routing.session_start_timeout;
        let started = tokio::time::timeout(
            timeout,
            node.begin_session(request, pending.reservation().clone()),
        )
        .await;

        let ticket = match started {
            Ok(Ok(ticket)) => ticket,
            Ok(Err(e)) => {
                pending.rollback();
                return Err(e);
            }
            Err(_) => {
                pending.rollback();
                return Err(BalancerError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        let reservation = pending.commit();
        if matches!(self.registry.health(&chosen.id), Ok(HealthState::Unreachable)) {
            self.abandon_session(&node, &reservation).await;
            return Err(BalancerError::node_unavailable(
                &chosen.id,
                "became unreachable while starting the session",
            ));
        }

        let record = RequestRecord {
            request_id: request.id.clone(),
            vehicle_id: request.vehicle_id.clone(),
            amount: request.amount,
            duration_secs: request.duration_secs,
            substation_id: chosen.id.clone(),
            session_id: ticket.session_id,
            reservation,
            attempts: attempt,
            load_before: chosen.reserved,
            max_capacity: chosen.max_capacity,
            admitted_at: ticket.started_at,
            estimated_completion: ticket.estimated_completion,
            status: SessionStatus::Active,
            finished_at: None,
        };
        let admission = record.admission();
        self.records.admit(record);

        Ok(admission)
    }

    /// End a session the node acknowledged after its substation went unreachable
    async fn abandon_session(&self, node: &Arc<dyn SubstationNode>, reservation: &Reservation) {
        if let Err(e) = node.end_session(reservation, SessionEnd::Cancelled).await {
            debug!(reservation_id = %reservation.id, error = %e, "Node did not hold the abandoned session");
            if let Err(e) = self.capacity.release(reservation) {
                debug!(reservation_id = %reservation.id, error = %e, "Abandoned reservation already released");
            }
        }
    }

    /// Move records whose reservation is no longer live into history.
    ///
    /// Returns how many records were retired.
    pub fn reconcile(&self) -> usize {
        let mut retired = 0;
        for record in self.records.active_records() {
            if !self.capacity.is_live(&record.reservation.id) && self.retire(&record).is_some() {
                retired += 1;
            }
        }
        if retired > 0 {
            debug!(retired, "Retired finished requests");
        }
        retired
    }

    /// Run [`reconcile`](Self::reconcile) every `sessions.reconcile_interval`
    /// until `shutdown` fires
    pub fn spawn_reconciler(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.sessions.reconcile_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.reconcile();
                    }
                }
            }

            debug!("Request reconciler stopped");
        })
    }

    fn retire_if_finished(&self, request_id: &str) -> Option<RequestRecord> {
        let record = self.records.active(request_id)?;
        if self.capacity.is_live(&record.reservation.id) {
            return None;
        }
        self.retire(&record)
    }

    /// Retire `stale` unless its request id has been admitted again since
    fn retire(&self, stale: &RequestRecord) -> Option<RequestRecord> {
        let record = self
            .records
            .take_admission(&stale.request_id, &stale.reservation.id)?;
        let session = self
            .node(&record.substation_id)
            .and_then(|node| node.session(&record.session_id));

        let (status, at) = match session {
            Some(session) => (session.status, session.end_time.unwrap_or_else(Utc::now)),
            None => (SessionStatus::Completed, Utc::now()),
        };
        let finished = record.finish(status, at);
        self.records.retire(finished.clone());
        Some(finished)
    }

    pub fn request_status(&self, request_id: &str) -> BalancerResult<RequestRecord> {
        if let Some(record) = self.records.active(request_id) {
            if self.capacity.is_live(&record.reservation.id) {
                return Ok(record);
            }
            if let Some(finished) = self.retire(&record) {
                return Ok(finished);
            }
        }

        self.records
            .finished(request_id)
            .ok_or_else(|| BalancerError::RequestNotFound {
                request_id: request_id.to_string(),
            })
    }

    pub fn list_requests(&self) -> RequestListing {
        self.reconcile();
        let active_requests = self.records.active_records();
        RequestListing {
            total_active: active_requests.len(),
            active_requests,
            recent_completed: self.records.history(),
        }
    }

    /// Cancel an admitted request: end its session and release its capacity.
    ///
    /// Cancelling a request that already finished returns its final record.
    pub async fn cancel(&self, request_id: &str) -> BalancerResult<RequestRecord> {
        let Some(record) = self.records.take(request_id) else {
            return self
                .records
                .finished(request_id)
                .ok_or_else(|| BalancerError::RequestNotFound {
                    request_id: request_id.to_string(),
                });
        };

        let ended = match self.node(&record.substation_id) {
            Some(node) => {
                let ended = node.end_session(&record.reservation, SessionEnd::Cancelled).await;
                match ended {
                    Ok(session) => Ok(session.status),
                    Err(BalancerError::AlreadyReleased { .. }) => Ok(node
                        .session(&record.session_id)
                        .map(|session| session.status)
                        .unwrap_or(SessionStatus::Completed)),
                    Err(e) => Err(e),
                }
            }
            // no node attached: release directly
            None => match self.capacity.release(&record.reservation) {
                Ok(()) | Err(BalancerError::AlreadyReleased { .. }) => Ok(SessionStatus::Cancelled),
                Err(e) => Err(e),
            },
        };

        let status = match ended {
            Ok(status) => status,
            Err(e) => {
                // put it back so the caller can retry
                self.records.admit(record);
                return Err(e);
            }
        };

        info!(request_id = %request_id, substation_id = %record.substation_id, status = %status, "Request cancelled");
        let finished = record.finish(status, Utc::now());
        self.records.retire(finished.clone());
        Ok(finished)
    }

    /// Force-end every session and release every reservation on a substation.
    ///
    /// Health is left unchanged.
    pub async fn drain_substation(&self, substation_id: &str) -> BalancerResult<DrainReport> {
        let live = self.capacity.live_reservations(substation_id)?;
        let node = self.node(substation_id);
        let mut report = DrainReport {
            substation_id: substation_id.to_string(),
            ..DrainReport::default()
        };

        for reservation in live {
            let ended = match &node {
                Some(node) => node.end_session(&reservation, SessionEnd::Drained).await,
                None => Err(BalancerError::AlreadyReleased {
                    reservation_id: reservation.id.to_string(),
                }),
            };

            match ended {
                Ok(_) => {
                    report.sessions_ended += 1;
                    report.capacity_released += reservation.amount;
                }
                Err(BalancerError::AlreadyReleased { .. }) => {
                    // no session holds it; release the orphan if still live
                    if self.capacity.release(&reservation).is_ok() {
                        report.orphans_released += 1;
                        report.capacity_released += reservation.amount;
                    }
                }
                Err(e) => {
                    warn!(
                        substation_id = %substation_id,
                        reservation_id = %reservation.id,
                        error = %e,
                        "Failed to drain reservation"
                    );
                }
            }
        }

        self.reconcile();
        warn!(
            substation_id = %substation_id,
            sessions_ended = report.sessions_ended,
            orphans_released = report.orphans_released,
            capacity_released = report.capacity_released,
            "Substation drained"
        );
        Ok(report)
    }

    /// Records currently in the active map, without retiring finished ones
    pub fn active_request_count(&self) -> usize {
        self.records.active_count()
    }

    pub fn system_status(&self) -> SystemStatus {
        self.reconcile();
        let substations = self.registry.list();
        let healthy_substations = substations
            .iter()
            .filter(|snapshot| snapshot.health.is_routable())
            .count();

        SystemStatus {
            total_substations: substations.len(),
            healthy_substations,
            substations,
            active_requests: self.records.active_count(),
            requests: self.outcomes.snapshot(),
            strategy: self.strategy.name().to_string(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            captured_at: Utc::now(),
            substations: self
                .registry
                .list()
                .into_iter()
                .map(|snapshot| SubstationMetrics {
                    substation_id: snapshot.id,
                    reserved: snapshot.reserved,
                    max: snapshot.max_capacity,
                    health: snapshot.health,
                })
                .collect(),
            requests: self.outcomes.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::HealthConfig;

    fn balancer() -> ChargeBalancer {
        let capacity = Arc::new(CapacityTracker::new());
        let registry = Arc::new(SubstationRegistry::new(capacity.clone(), HealthConfig::default()));
        ChargeBalancer::new(registry, capacity, RoutingConfig::default(), SessionConfig::default())
    }

    #[tokio::test]
    async fn test_no_substations_means_no_backend() {
        let balancer = balancer();
        let err = balancer.route(ChargeRequest::new("r1", "ev", 1, 0)).await.unwrap_err();
        assert_eq!(err, BalancerError::NoBackendAvailable);
        assert_eq!(balancer.metrics_snapshot().requests.rejected, 1);
    }

    #[tokio::test]
    async fn test_picks_least_loaded_by_ratio() {
        let balancer = balancer();
        balancer.register_local("a", 100).unwrap();
        balancer.register_local("b", 200).unwrap();
        balancer.capacity().try_reserve("a", 40).unwrap();
        balancer.capacity().try_reserve("b", 60).unwrap();

        let admission = balancer.route(ChargeRequest::new("r1", "ev", 1, 0)).await.unwrap();
        assert_eq!(admission.substation_id, "b");
        assert_eq!(admission.load_before, 60);
        assert_eq!(admission.attempts, 1);
    }

    #[tokio::test]
    async fn test_pending_reservation_drop_releases() {
        let balancer = balancer();
        balancer.register_local("a", 10).unwrap();
        let reservation = balancer.capacity().try_reserve("a", 4).unwrap();

        drop(PendingReservation::new(balancer.capacity().clone(), reservation.clone()));
        assert_eq!(balancer.capacity().current_load("a").unwrap().reserved, 0);

        let second = balancer.capacity().try_reserve("a", 4).unwrap();
        let committed = PendingReservation::new(balancer.capacity().clone(), second).commit();
        assert!(balancer.capacity().is_live(&committed.id));
    }

    #[tokio::test]
    async fn test_duplicate_active_request_is_rejected() {
        let balancer = balancer();
        balancer.register_local("a", 10).unwrap();
        balancer.route(ChargeRequest::new("r1", "ev", 1, 0)).await.unwrap();

        let err = balancer.route(ChargeRequest::new("r1", "ev", 1, 0)).await.unwrap_err();
        assert!(matches!(err, BalancerError::DuplicateRequest { .. }));
        assert_eq!(balancer.capacity().current_load("a").unwrap().reserved, 1);
    }
}
