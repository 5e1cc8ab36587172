//! Charge sessions and the book that both node kinds keep them in.
//!
//! Ending a session is the only path that releases a reservation from the
//! node side. [`SessionBook::finish`] removes the session from the active set
//! first, so a timer firing and an operator cancel racing on the same session
//! produce exactly one release.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::capacity::{CapacityTracker, Reservation, ReservationId};
use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::{ChargeRequest, SubstationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
    Drained,
}

impl SessionStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Drained => "drained",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session is being ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    /// The requested duration elapsed, or the remote node reported completion
    Completed,
    /// The request was cancelled after admission
    Cancelled,
    /// An operator drained the substation
    Drained,
}

impl From<SessionEnd> for SessionStatus {
    fn from(end: SessionEnd) -> Self {
        match end {
            SessionEnd::Completed => SessionStatus::Completed,
            SessionEnd::Cancelled => SessionStatus::Cancelled,
            SessionEnd::Drained => SessionStatus::Drained,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeSession {
    pub session_id: String,
    pub request_id: String,
    pub vehicle_id: String,
    pub substation_id: SubstationId,
    pub reservation_id: ReservationId,
    pub power: u64,
    pub duration_secs: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
}

impl ChargeSession {
    pub fn start(session_id: String, request: &ChargeRequest, reservation: &Reservation) -> Self {
        Self {
            session_id,
            request_id: request.id.clone(),
            vehicle_id: request.vehicle_id.clone(),
            substation_id: reservation.substation_id.clone(),
            reservation_id: reservation.id.clone(),
            power: reservation.amount,
            duration_secs: request.duration_secs,
            start_time: Utc::now(),
            end_time: None,
            status: SessionStatus::Active,
        }
    }
}

/// Acknowledgement returned by a node once a session has started
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTicket {
    pub session_id: String,
    pub substation_id: SubstationId,
    pub started_at: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionListing {
    pub active_sessions: Vec<ChargeSession>,
    pub completed_sessions: Vec<ChargeSession>,
}

/// Active sessions plus a bounded history of finished ones
pub struct SessionBook {
    substation_id: SubstationId,
    capacity: Arc<CapacityTracker>,
    active: DashMap<ReservationId, ChargeSession>,
    history: Mutex<VecDeque<ChargeSession>>,
    history_limit: usize,
}

impl SessionBook {
    pub fn new(substation_id: impl Into<SubstationId>, capacity: Arc<CapacityTracker>, history_limit: usize) -> Self {
        Self {
            substation_id: substation_id.into(),
            capacity,
            active: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(history_limit)),
            history_limit,
        }
    }

    pub fn substation_id(&self) -> &str {
        &self.substation_id
    }

    pub fn open(&self, session: ChargeSession) {
        counter!(
            "charging_sessions_total",
            "substation_id" => self.substation_id.clone(),
            "status" => "started"
        )
        .increment(1);
        info!(
            substation_id = %self.substation_id,
            session_id = %session.session_id,
            vehicle_id = %session.vehicle_id,
            power = session.power,
            duration_secs = session.duration_secs,
            "Started charging session"
        );
        self.active.insert(session.reservation_id.clone(), session);
    }

    /// End the session holding `reservation` and release its capacity.
    ///
    /// Returns `AlreadyReleased` without touching the tracker when no active
    /// session holds the reservation.
    pub fn finish(&self, reservation: &Reservation, end: SessionEnd) -> BalancerResult<ChargeSession> {
        let Some((_, mut session)) = self.active.remove(&reservation.id) else {
            return Err(BalancerError::AlreadyReleased {
                reservation_id: reservation.id.to_string(),
            });
        };

        let released = self.capacity.release(reservation);

        let ended_at = Utc::now();
        session.end_time = Some(ended_at);
        session.status = end.into();

        let elapsed = (ended_at - session.start_time).to_std().unwrap_or_default();
        counter!(
            "charging_sessions_total",
            "substation_id" => self.substation_id.clone(),
            "status" => session.status.as_str()
        )
        .increment(1);
        histogram!(
            "charging_session_duration_seconds",
            "substation_id" => self.substation_id.clone()
        )
        .record(elapsed.as_secs_f64());
        info!(
            substation_id = %self.substation_id,
            session_id = %session.session_id,
            status = %session.status,
            elapsed_secs = elapsed.as_secs_f64(),
            "Charging session ended"
        );

        self.remember(session.clone());
        released.map(|_| session)
    }

    fn remember(&self, session: ChargeSession) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() == self.history_limit {
            history.pop_front();
        }
        history.push_back(session);
    }

    pub fn is_active(&self, reservation_id: &ReservationId) -> bool {
        self.active.contains_key(reservation_id)
    }

    /// Look a session up by id among active sessions, then history
    pub fn get(&self, session_id: &str) -> Option<ChargeSession> {
        if let Some(session) = self
            .active
            .iter()
            .find(|entry| entry.value().session_id == session_id)
        {
            return Some(session.value().clone());
        }

        self.history
            .lock()
            .iter()
            .rev()
            .find(|session| session.session_id == session_id)
            .cloned()
    }

    pub fn listing(&self) -> SessionListing {
        let mut active_sessions: Vec<ChargeSession> =
            self.active.iter().map(|entry| entry.value().clone()).collect();
        active_sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time));

        SessionListing {
            active_sessions,
            completed_sessions: self.history.lock().iter().cloned().collect(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
