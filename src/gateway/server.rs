//! # HTTP Server Module
//!
//! The balancer's own HTTP surface, built on Axum. It exposes charge request
//! assignment, request tracking, substation status, operator drain, a liveness
//! endpoint and the Prometheus scrape endpoint.
//!
//! Errors are returned as [`BalancerError`], whose `IntoResponse` impl renders
//! the structured JSON error body.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument};

use crate::core::config::{MetricsConfig, ServerConfig};
use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::{ChargeRequest, SubstationSnapshot};
use crate::load_balancing::{ChargeBalancer, DrainReport, RequestListing, RequestRecord, SystemStatus};
use crate::observability::metrics::MetricsExporter;
use crate::substation::SessionListing;

/// Shared state for every handler
#[derive(Clone)]
pub struct ServerState {
    pub balancer: Arc<ChargeBalancer>,
    pub metrics: Option<MetricsExporter>,
}

impl ServerState {
    pub fn new(balancer: Arc<ChargeBalancer>) -> Self {
        Self {
            balancer,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsExporter) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Body of `POST /api/assign-substation`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignRequest {
    /// Generated when omitted
    #[serde(default)]
    pub request_id: Option<String>,
    pub vehicle_id: String,
    pub requested_power: u64,
    /// Session length in seconds
    #[serde(default)]
    pub duration: u64,
}

impl AssignRequest {
    fn into_charge_request(self) -> ChargeRequest {
        match self.request_id {
            Some(id) => ChargeRequest::new(id, self.vehicle_id, self.requested_power, self.duration),
            None => ChargeRequest::generate(self.vehicle_id, self.requested_power, self.duration),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignResponse {
    pub status: String,
    pub request_id: String,
    pub substation_id: String,
    pub session_id: String,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub substation_load_before: u64,
    pub substation_capacity: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStatusResponse {
    pub status: String,
    pub details: RequestRecord,
}

impl From<RequestRecord> for RequestStatusResponse {
    fn from(record: RequestRecord) -> Self {
        Self {
            status: record.status.to_string(),
            details: record,
        }
    }
}

/// Router for the balancer API
pub struct BalancerRouter;

impl BalancerRouter {
    pub fn create_router(state: ServerState, metrics_path: &str) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route(metrics_path, get(render_metrics))
            .route("/api/assign-substation", post(assign_substation))
            .route("/api/status/:request_id", get(request_status))
            .route("/api/requests", get(list_requests))
            .route("/api/requests/:request_id", delete(cancel_request))
            .route("/api/substations", get(list_substations))
            .route("/api/substations/:substation_id/sessions", get(substation_sessions))
            .route("/api/substations/:substation_id/drain", post(drain_substation))
            .route("/api/system-status", get(system_status))
            .route("/api/metrics", get(metrics_snapshot))
            .with_state(state)
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "load_balancer" }))
}

async fn render_metrics(State(state): State<ServerState>) -> Response {
    match &state.metrics {
        Some(exporter) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            exporter.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter disabled").into_response(),
    }
}

#[instrument(skip(state, payload))]
async fn assign_substation(
    State(state): State<ServerState>,
    payload: Result<Json<AssignRequest>, JsonRejection>,
) -> Result<Json<AssignResponse>, BalancerError> {
    let Json(body) = payload.map_err(|e| BalancerError::invalid_request("body", e.body_text()))?;
    let request = body.into_charge_request();
    debug!(request_id = %request.id, amount = request.amount, "Received charge request");

    let admission = state.balancer.route(request).await?;

    Ok(Json(AssignResponse {
        status: "assigned".to_string(),
        request_id: admission.request_id,
        substation_id: admission.substation_id,
        session_id: admission.session_id,
        estimated_completion: admission.estimated_completion,
        substation_load_before: admission.load_before,
        substation_capacity: admission.max_capacity,
        attempts: admission.attempts,
    }))
}

async fn request_status(
    State(state): State<ServerState>,
    Path(request_id): Path<String>,
) -> Result<Json<RequestStatusResponse>, BalancerError> {
    let record = state.balancer.request_status(&request_id)?;
    Ok(Json(record.into()))
}

async fn list_requests(State(state): State<ServerState>) -> Json<RequestListing> {
    Json(state.balancer.list_requests())
}

async fn cancel_request(
    State(state): State<ServerState>,
    Path(request_id): Path<String>,
) -> Result<Json<RequestStatusResponse>, BalancerError> {
    let record = state.balancer.cancel(&request_id).await?;
    Ok(Json(record.into()))
}

async fn list_substations(State(state): State<ServerState>) -> Json<Vec<SubstationSnapshot>> {
    Json(state.balancer.registry().list())
}

async fn substation_sessions(
    State(state): State<ServerState>,
    Path(substation_id): Path<String>,
) -> Result<Json<SessionListing>, BalancerError> {
    state.balancer.registry().get(&substation_id)?;
    let node = state
        .balancer
        .node(&substation_id)
        .ok_or_else(|| BalancerError::node_unavailable(&substation_id, "no session handler attached"))?;
    Ok(Json(node.sessions()))
}

async fn drain_substation(
    State(state): State<ServerState>,
    Path(substation_id): Path<String>,
) -> Result<Json<DrainReport>, BalancerError> {
    Ok(Json(state.balancer.drain_substation(&substation_id).await?))
}

async fn system_status(State(state): State<ServerState>) -> Json<SystemStatus> {
    Json(state.balancer.system_status())
}

async fn metrics_snapshot(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.balancer.metrics_snapshot())
}

/// The balancer's HTTP server
pub struct BalancerServer {
    bind_addr: SocketAddr,
    app: Router,
}

impl BalancerServer {
    pub fn new(config: &ServerConfig, metrics: &MetricsConfig, state: ServerState) -> BalancerResult<Self> {
        let bind_addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
            .parse()
            .map_err(|e| BalancerError::config(format!("Invalid bind address: {}", e)))?;

        let app = BalancerRouter::create_router(state, &metrics.endpoint_path)
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

        Ok(Self { bind_addr, app })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Serve until `shutdown` is cancelled
    #[instrument(skip(self, shutdown))]
    pub async fn start(self, shutdown: CancellationToken) -> BalancerResult<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| BalancerError::internal(format!("Failed to bind server to {}: {}", self.bind_addr, e)))?;

        info!("Balancer HTTP server listening on {}", self.bind_addr);

        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| BalancerError::internal(format!("Server error: {}", e)))?;

        info!("Balancer HTTP server stopped");
        Ok(())
    }
}
