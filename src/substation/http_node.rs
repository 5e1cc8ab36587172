//! Remote substation service client.
//!
//! Sessions are forwarded with `POST {url}/charge`. The node then polls
//! `GET {url}/sessions/{session_id}` until the remote side reports the session
//! finished, and releases the reservation locally. Cancelling or draining ends
//! the session in the local book only; the remote service has no cancel call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capacity::{CapacityTracker, Reservation};
use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::ChargeRequest;
use crate::substation::node::SubstationNode;
use crate::substation::session::{
    ChargeSession, SessionBook, SessionEnd, SessionListing, SessionTicket,
};

#[derive(Debug, Serialize)]
struct ChargeCall<'a> {
    request_id: &'a str,
    vehicle_id: &'a str,
    requested_power: u64,
    duration: u64,
}

#[derive(Debug, Deserialize)]
struct ChargeAccepted {
    session_id: String,
    #[serde(default)]
    estimated_completion: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RemoteSession {
    status: String,
}

pub struct HttpSubstationNode {
    base_url: String,
    client: HttpClient,
    book: Arc<SessionBook>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl HttpSubstationNode {
    pub fn new(
        substation_id: impl Into<String>,
        base_url: impl Into<String>,
        capacity: Arc<CapacityTracker>,
        request_timeout: Duration,
        poll_interval: Duration,
        history_limit: usize,
    ) -> BalancerResult<Self> {
        let client = HttpClient::builder().timeout(request_timeout).build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            book: Arc::new(SessionBook::new(substation_id, capacity, history_limit)),
            poll_interval,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Stop every session watcher; sessions stay in the book as they are
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn watch(&self, session_id: String, reservation: Reservation) {
        let client = self.client.clone();
        let book = self.book.clone();
        let url = format!("{}/sessions/{}", self.base_url, session_id);
        let poll_interval = self.poll_interval;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            // first tick is immediate
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                if !book.is_active(&reservation.id) {
                    return;
                }

                let finished = match client.get(&url).send().await {
                    Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                        warn!(session_id = %session_id, "Remote substation no longer knows the session");
                        true
                    }
                    Ok(response) if response.status().is_success() => {
                        match response.json::<RemoteSession>().await {
                            Ok(remote) => remote.status != "active",
                            Err(e) => {
                                debug!(session_id = %session_id, error = %e, "Unreadable session status");
                                false
                            }
                        }
                    }
                    Ok(response) => {
                        debug!(session_id = %session_id, status = %response.status(), "Session poll failed");
                        false
                    }
                    Err(e) => {
                        debug!(session_id = %session_id, error = %e, "Session poll failed");
                        false
                    }
                };

                if finished {
                    if let Err(e) = book.finish(&reservation, SessionEnd::Completed) {
                        debug!(session_id = %session_id, error = %e, "Session already ended");
                    }
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl SubstationNode for HttpSubstationNode {
    fn substation_id(&self) -> &str {
        self.book.substation_id()
    }

    async fn begin_session(
        &self,
        request: &ChargeRequest,
        reservation: Reservation,
    ) -> BalancerResult<SessionTicket> {
        let body = ChargeCall {
            request_id: &request.id,
            vehicle_id: &request.vehicle_id,
            requested_power: reservation.amount,
            duration: request.duration_secs,
        };

        let response = self
            .client
            .post(format!("{}/charge", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| BalancerError::node_unavailable(self.substation_id(), e.to_string()))?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Err(BalancerError::node_unavailable(
                self.substation_id(),
                "remote substation reports insufficient capacity",
            ));
        }
        if !status.is_success() {
            return Err(BalancerError::node_unavailable(
                self.substation_id(),
                format!("remote substation answered {}", status),
            ));
        }

        let accepted: ChargeAccepted = response
            .json()
            .await
            .map_err(|e| BalancerError::node_unavailable(self.substation_id(), e.to_string()))?;

        let session = ChargeSession::start(accepted.session_id.clone(), request, &reservation);
        let ticket = SessionTicket {
            session_id: session.session_id.clone(),
            substation_id: session.substation_id.clone(),
            started_at: session.start_time,
            estimated_completion: accepted
                .estimated_completion
                .or_else(|| request.estimated_completion(session.start_time)),
        };
        self.book.open(session);
        self.watch(accepted.session_id, reservation);

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

impl Drop for HttpSubstationNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
