//! Request records kept by the balancer for admitted requests.
//!
//! A record stays in the active map while its reservation is live in the
//! capacity tracker. Finished records move to a bounded history when they are
//! read, when their request id is routed again, or on the balancer's
//! periodic sweep (`ChargeBalancer::spawn_reconciler`).

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::capacity::{Reservation, ReservationId};
use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::{Admission, SubstationId};
use crate::substation::SessionStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub vehicle_id: String,
    pub amount: u64,
    pub duration_secs: u64,
    pub substation_id: SubstationId,
    pub session_id: String,
    pub reservation: Reservation,
    pub attempts: u32,
    pub load_before: u64,
    pub max_capacity: u64,
    pub admitted_at: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RequestRecord {
    pub fn admission(&self) -> Admission {
        Admission {
            request_id: self.request_id.clone(),
            substation_id: self.substation_id.clone(),
            session_id: self.session_id.clone(),
            reservation_id: self.reservation.id.to_string(),
            amount: self.amount,
            attempts: self.attempts,
            load_before: self.load_before,
            max_capacity: self.max_capacity,
            estimated_completion: self.estimated_completion,
        }
    }

    pub(crate) fn finish(mut self, status: SessionStatus, at: DateTime<Utc>) -> Self {
        self.status = if status.is_finished() {
            status
        } else {
            SessionStatus::Completed
        };
        self.finished_at = Some(at);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestListing {
    pub active_requests: Vec<RequestRecord>,
    pub recent_completed: Vec<RequestRecord>,
    pub total_active: usize,
}

/// Request identifier held for the duration of one routing call
pub(crate) struct RequestClaim<'a> {
    book: &'a RequestBook,
    request_id: String,
}

impl Drop for RequestClaim<'_> {
    fn drop(&mut self) {
        self.book.claims.remove(&self.request_id);
    }
}

pub(crate) struct RequestBook {
    claims: DashSet<String>,
    active: DashMap<String, RequestRecord>,
    history: Mutex<VecDeque<RequestRecord>>,
    history_limit: usize,
}

impl RequestBook {
    pub(crate) fn new(history_limit: usize) -> Self {
        Self {
            claims: DashSet::new(),
            active: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(history_limit)),
            history_limit,
        }
    }

    /// Reserve a request id for routing; fails if it is routing or active
    pub(crate) fn claim(&self, request_id: &str) -> BalancerResult<RequestClaim<'_>> {
        if !self.claims.insert(request_id.to_string()) {
            return Err(BalancerError::DuplicateRequest {
                request_id: request_id.to_string(),
            });
        }
        let claim = RequestClaim {
            book: self,
            request_id: request_id.to_string(),
        };

        if self.active.contains_key(request_id) {
            return Err(BalancerError::DuplicateRequest {
                request_id: request_id.to_string(),
            });
        }
        Ok(claim)
    }

    pub(crate) fn admit(&self, record: RequestRecord) {
        self.active.insert(record.request_id.clone(), record);
    }

    pub(crate) fn active(&self, request_id: &str) -> Option<RequestRecord> {
        self.active.get(request_id).map(|entry| entry.value().clone())
    }

    pub(crate) fn active_records(&self) -> Vec<RequestRecord> {
        let mut records: Vec<RequestRecord> =
            self.active.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by(|a, b| a.admitted_at.cmp(&b.admitted_at));
        records
    }

    /// Remove an active record; only one caller wins
    pub(crate) fn take(&self, request_id: &str) -> Option<RequestRecord> {
        self.active.remove(request_id).map(|(_, record)| record)
    }

    /// Remove an active record only if it still holds `reservation_id`
    pub(crate) fn take_admission(&self, request_id: &str, reservation_id: &ReservationId) -> Option<RequestRecord> {
        self.active
            .remove_if(request_id, |_, record| &record.reservation.id == reservation_id)
            .map(|(_, record)| record)
    }

    pub(crate) fn retire(&self, record: RequestRecord) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() == self.history_limit {
            history.pop_front();
        }
        history.push_back(record);
    }

    pub(crate) fn finished(&self, request_id: &str) -> Option<RequestRecord> {
        self.history
            .lock()
            .iter()
            .rev()
            .find(|record| record.request_id == request_id)
            .cloned()
    }

    pub(crate) fn history(&self) -> Vec<RequestRecord> {
        self.history.lock().iter().cloned().collect()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.len()
    }
}
