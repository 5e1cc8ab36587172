//! # HTTP API Tests
//!
//! Exercises the balancer's HTTP surface through `axum-test`, with
//! in-process substations behind it.

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};
use std::sync::Arc;

use substation_balancer::capacity::CapacityTracker;
use substation_balancer::core::config::{HealthConfig, RoutingConfig, SessionConfig};
use substation_balancer::core::types::HealthState;
use substation_balancer::discovery::SubstationRegistry;
use substation_balancer::gateway::{AssignResponse, BalancerRouter, ServerState};
use substation_balancer::load_balancing::ChargeBalancer;

fn balancer(substations: &[(&str, u64)]) -> Arc<ChargeBalancer> {
    let capacity = Arc::new(CapacityTracker::new());
    let registry = Arc::new(SubstationRegistry::new(capacity.clone(), HealthConfig::default()));
    let balancer = ChargeBalancer::new(
        registry,
        capacity,
        RoutingConfig::default(),
        SessionConfig::default(),
    );
    for (id, max) in substations {
        balancer.register_local(id, *max).unwrap();
    }
    Arc::new(balancer)
}

fn server_for(balancer: Arc<ChargeBalancer>) -> TestServer {
    let app = BalancerRouter::create_router(ServerState::new(balancer), "/metrics");
    TestServer::new(app).unwrap()
}

fn default_server() -> (TestServer, Arc<ChargeBalancer>) {
    let balancer = balancer(&[("substation1", 150), ("substation2", 120), ("substation3", 100)]);
    (server_for(balancer.clone()), balancer)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (server, _) = default_server();

    let response = server.get("/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["status"], "healthy");
}

#[tokio::test]
async fn test_assign_substation() {
    let (server, balancer) = default_server();

    let response = server
        .post("/api/assign-substation")
        .json(&json!({
            "request_id": "req-1",
            "vehicle_id": "ev-42",
            "requested_power": 50,
            "duration": 1800
        }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: AssignResponse = response.json();
    assert_eq!(body.status, "assigned");
    assert_eq!(body.request_id, "req-1");
    assert_eq!(body.substation_id, "substation1");
    assert_eq!(body.substation_load_before, 0);
    assert_eq!(body.substation_capacity, 150);
    assert_eq!(body.attempts, 1);
    assert!(body.estimated_completion.is_some());
    assert_eq!(balancer.capacity().current_load("substation1").unwrap().reserved, 50);
}

#[tokio::test]
async fn test_assign_generates_request_id() {
    let (server, _) = default_server();

    let response = server
        .post("/api/assign-substation")
        .json(&json!({ "vehicle_id": "ev-1", "requested_power": 5 }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: AssignResponse = response.json();
    assert!(!body.request_id.is_empty());
    assert!(body.estimated_completion.is_none());
}

#[tokio::test]
async fn test_assign_rejects_malformed_body() {
    let (server, _) = default_server();

    let response = server
        .post("/api/assign-substation")
        .json(&json!({ "vehicle_id": "ev-1" }))
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["error"]["type"], "invalid_request");
}

#[tokio::test]
async fn test_assign_rejects_zero_power() {
    let (server, _) = default_server();

    let response = server
        .post("/api/assign-substation")
        .json(&json!({ "vehicle_id": "ev-1", "requested_power": 0 }))
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "invalid_amount");
    assert_eq!(body["error"]["retryable"], false);
}

#[tokio::test]
async fn test_saturated_fleet_returns_service_unavailable() {
    let balancer = balancer(&[("small", 10)]);
    let server = server_for(balancer.clone());
    balancer.capacity().try_reserve("small", 8).unwrap();

    let response = server
        .post("/api/assign-substation")
        .json(&json!({ "vehicle_id": "ev-1", "requested_power": 5 }))
        .await;

    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "all_backends_saturated");
    assert_eq!(body["error"]["retryable"], true);
}

#[tokio::test]
async fn test_no_healthy_substation_returns_service_unavailable() {
    let (server, balancer) = default_server();
    for id in ["substation1", "substation2", "substation3"] {
        balancer.registry().mark_health(id, HealthState::Unreachable).unwrap();
    }

    let response = server
        .post("/api/assign-substation")
        .json(&json!({ "vehicle_id": "ev-1", "requested_power": 5 }))
        .await;

    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json::<Value>()["error"]["type"], "no_backend_available");
}

#[tokio::test]
async fn test_request_status_and_cancel() {
    let (server, balancer) = default_server();
    server
        .post("/api/assign-substation")
        .json(&json!({
            "request_id": "req-9",
            "vehicle_id": "ev-9",
            "requested_power": 30,
            "duration": 3600
        }))
        .await;

    let status = server.get("/api/status/req-9").await;
    assert_eq!(status.status_code(), StatusCode::OK);
    let body: Value = status.json();
    assert_eq!(body["status"], "active");
    assert_eq!(body["details"]["substation_id"], "substation1");

    let cancelled = server.delete("/api/requests/req-9").await;
    assert_eq!(cancelled.status_code(), StatusCode::OK);
    assert_eq!(cancelled.json::<Value>()["status"], "cancelled");
    assert_eq!(balancer.capacity().current_load("substation1").unwrap().reserved, 0);

    let after = server.get("/api/status/req-9").await;
    assert_eq!(after.json::<Value>()["status"], "cancelled");

    let missing = server.get("/api/status/nope").await;
    assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(missing.json::<Value>()["error"]["type"], "request_not_found");
}

#[tokio::test]
async fn test_duplicate_active_request_conflicts() {
    let (server, _) = default_server();
    let body = json!({ "request_id": "dup", "vehicle_id": "ev", "requested_power": 1 });

    assert_eq!(
        server.post("/api/assign-substation").json(&body).await.status_code(),
        StatusCode::OK
    );
    let second = server.post("/api/assign-substation").json(&body).await;
    assert_eq!(second.status_code(), StatusCode::CONFLICT);
    assert_eq!(second.json::<Value>()["error"]["type"], "duplicate_request");
}

#[tokio::test]
async fn test_list_requests() {
    let (server, _) = default_server();
    for i in 0..3 {
        server
            .post("/api/assign-substation")
            .json(&json!({ "request_id": format!("r{}", i), "vehicle_id": "ev", "requested_power": 2 }))
            .await;
    }
    server.delete("/api/requests/r0").await;

    let response = server.get("/api/requests").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["total_active"], 2);
    assert_eq!(body["recent_completed"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_substations_and_sessions() {
    let (server, _) = default_server();
    server
        .post("/api/assign-substation")
        .json(&json!({ "request_id": "r1", "vehicle_id": "ev", "requested_power": 15 }))
        .await;

    let listing: Value = server.get("/api/substations").await.json();
    let substations = listing.as_array().unwrap();
    assert_eq!(substations.len(), 3);
    assert_eq!(substations[0]["id"], "substation1");
    assert_eq!(substations[0]["reserved"], 15);
    assert_eq!(substations[0]["health"], "healthy");

    let sessions = server.get("/api/substations/substation1/sessions").await;
    assert_eq!(sessions.status_code(), StatusCode::OK);
    let body: Value = sessions.json();
    assert_eq!(body["active_sessions"].as_array().unwrap().len(), 1);
    assert_eq!(body["active_sessions"][0]["request_id"], "r1");

    let unknown = server.get("/api/substations/ghost/sessions").await;
    assert_eq!(unknown.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_drain_endpoint() {
    let (server, balancer) = default_server();
    for i in 0..2 {
        server
            .post("/api/assign-substation")
            .json(&json!({ "request_id": format!("r{}", i), "vehicle_id": "ev", "requested_power": 10 }))
            .await;
    }
    let held = balancer.capacity().current_load("substation1").unwrap().reserved;
    assert!(held > 0);

    let response = server.post("/api/substations/substation1/drain").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let report: Value = response.json();
    assert_eq!(report["capacity_released"], held);
    assert_eq!(balancer.capacity().current_load("substation1").unwrap().reserved, 0);
    assert_eq!(balancer.registry().health("substation1").unwrap(), HealthState::Healthy);

    let unknown = server.post("/api/substations/ghost/drain").await;
    assert_eq!(unknown.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_system_status_and_metrics_snapshot() {
    let (server, _) = default_server();
    server
        .post("/api/assign-substation")
        .json(&json!({ "vehicle_id": "ev", "requested_power": 4 }))
        .await;
    server
        .post("/api/assign-substation")
        .json(&json!({ "vehicle_id": "ev", "requested_power": 1000 }))
        .await;

    let status: Value = server.get("/api/system-status").await.json();
    assert_eq!(status["total_substations"], 3);
    assert_eq!(status["healthy_substations"], 3);
    assert_eq!(status["active_requests"], 1);
    assert_eq!(status["requests"]["admitted"], 1);
    assert_eq!(status["requests"]["rejected"], 1);
    assert_eq!(status["strategy"], "least_loaded");

    let metrics: Value = server.get("/api/metrics").await.json();
    assert_eq!(metrics["substations"].as_array().unwrap().len(), 3);
    assert_eq!(metrics["requests"]["admitted"], 1);
}

#[tokio::test]
async fn test_prometheus_endpoint_without_exporter() {
    let (server, _) = default_server();

    let response = server.get("/metrics").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}
