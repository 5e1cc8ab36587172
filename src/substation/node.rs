//! # Substation Nodes
//!
//! A node owns the charge sessions of one substation. The balancer hands it a
//! reservation that is already held in the capacity tracker; the node never
//! re-checks capacity. When a session ends, for whatever reason, the node
//! releases the reservation through its [`SessionBook`].

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::capacity::{CapacityTracker, Reservation};
use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::ChargeRequest;
use crate::substation::session::{
    ChargeSession, SessionBook, SessionEnd, SessionListing, SessionTicket,
};

/// Session handling for one substation
#[async_trait]
pub trait SubstationNode: Send + Sync {
    fn substation_id(&self) -> &str;

    /// Start a session for an already reserved request
    async fn begin_session(
        &self,
        request: &ChargeRequest,
        reservation: Reservation,
    ) -> BalancerResult<SessionTicket>;

    /// End the session holding `reservation`, releasing it exactly once
    async fn end_session(
        &self,
        reservation: &Reservation,
        end: SessionEnd,
    ) -> BalancerResult<ChargeSession>;

    fn session(&self, session_id: &str) -> Option<ChargeSession>;

    fn sessions(&self) -> SessionListing;
}

/// In-process substation that completes each session after its duration
pub struct LocalSubstation {
    book: Arc<SessionBook>,
    online: AtomicBool,
    start_delay: Duration,
}

impl LocalSubstation {
    pub fn new(substation_id: impl Into<String>, capacity: Arc<CapacityTracker>, history_limit: usize) -> Self {
        Self {
            book: Arc::new(SessionBook::new(substation_id, capacity, history_limit)),
            online: AtomicBool::new(true),
            start_delay: Duration::ZERO,
        }
    }

    /// Delay before a session is acknowledged
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// An offline node refuses new sessions; running ones continue
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn active_sessions(&self) -> usize {
        self.book.active_count()
    }

    fn schedule_completion(&self, reservation: Reservation, duration: Duration) {
        let book = self.book.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            match book.finish(&reservation, SessionEnd::Completed) {
                Ok(_) => {}
                Err(BalancerError::AlreadyReleased { .. }) => {
                    debug!(reservation_id = %reservation.id, "Session already ended before its timer fired");
                }
                Err(e) => warn!(reservation_id = %reservation.id, error = %e, "Failed to complete session"),
            }
        });
    }
}

#[async_trait]
impl SubstationNode for LocalSubstation {
    fn substation_id(&self) -> &str {
        self.book.substation_id()
    }

    async fn begin_session(
        &self,
        request: &ChargeRequest,
        reservation: Reservation,
    ) -> BalancerResult<SessionTicket> {
        if reservation.substation_id != self.substation_id() {
            return Err(BalancerError::internal(format!(
                "reservation for '{}' handed to node '{}'",
                reservation.substation_id,
                self.substation_id()
            )));
        }

        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        if !self.is_online() {
            return Err(BalancerError::node_unavailable(self.substation_id(), "node is offline"));
        }

        let session = ChargeSession::start(Uuid::new_v4().to_string(), request, &reservation);
        let ticket = SessionTicket {
            session_id: session.session_id.clone(),
            substation_id: session.substation_id.clone(),
            started_at: session.start_time,
            estimated_completion: request.estimated_completion(session.start_time),
        };
        self.book.open(session);

        if request.duration_secs > 0 {
            self.schedule_completion(reservation, request.duration());
        }

        Ok(ticket)
    }

    async fn end_session(
        &self,
        reservation: &Reservation,
        end: SessionEnd,
    ) -> BalancerResult<ChargeSession> {
        self.book.finish(reservation, end)
    }

    fn session(&self, session_id: &str) -> Option<ChargeSession> {
        self.book.get(session_id)
    }

    fn sessions(&self) -> SessionListing {
        self.book.listing()
    }
}

impl std::fmt::Debug for LocalSubstation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSubstation")
            .field("substation_id", &self.substation_id())
            .field("online", &self.is_online())
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}
