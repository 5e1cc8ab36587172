//! # Error Handling Module
//!
//! Every failure the balancer can produce is a variant of [`BalancerError`].
//! The enum is built with `thiserror`, carries only owned data so it can be
//! cloned into request records and metrics, and maps onto an HTTP status code
//! for the admin/API surface.
//!
//! The taxonomy mirrors how failures propagate through the admission core:
//!
//! - `CapacityExceeded` is expected and recovered locally by trying the next
//!   ranked candidate.
//! - `NoBackendAvailable` and `AllBackendsSaturated` surface to the caller as a
//!   rejection and are never retried internally.
//! - `RoutingFailed` means the hand-off retry budget is exhausted.
//! - `AlreadyReleased` is an invariant violation scoped to one reservation.
//! - `DuplicateId` is a startup misconfiguration.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::core::types::RequestOutcome;

/// Result alias used throughout the balancer.
pub type BalancerResult<T> = Result<T, BalancerError>;

/// All errors produced by the balancer core and its collaborators.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BalancerError {
    /// A substation with this identifier is already registered
    #[error("Substation already registered: {substation_id}")]
    DuplicateId { substation_id: String },

    /// The identifier does not name a registered substation
    #[error("Unknown substation: {substation_id}")]
    UnknownSubstation { substation_id: String },

    /// Reserving `requested` would push the substation past its max capacity
    #[error("Capacity exceeded on {substation_id}: requested {requested}, reserved {reserved} of {max}")]
    CapacityExceeded {
        substation_id: String,
        requested: u64,
        reserved: u64,
        max: u64,
    },

    /// Reservation amounts must be positive
    #[error("Invalid charge amount: {amount}")]
    InvalidAmount { amount: u64 },

    /// No substation is currently healthy
    #[error("No substation available")]
    NoBackendAvailable,

    /// Every healthy substation rejected the reservation
    #[error("All {candidates} substations are saturated for a request of {requested}")]
    AllBackendsSaturated { requested: u64, candidates: usize },

    /// The reservation handle was already released
    #[error("Reservation already released: {reservation_id}")]
    AlreadyReleased { reservation_id: String },

    /// The hand-off retry budget is exhausted
    #[error("Routing failed after {attempts} attempts: {reason}")]
    RoutingFailed { attempts: u32, reason: String },

    /// The substation node refused or could not acknowledge a session
    #[error("Substation {substation_id} unavailable: {reason}")]
    NodeUnavailable { substation_id: String, reason: String },

    /// No tracked request has this identifier
    #[error("Request not found: {request_id}")]
    RequestNotFound { request_id: String },

    /// A request with this identifier is already being tracked
    #[error("Request already exists: {request_id}")]
    DuplicateRequest { request_id: String },

    /// Malformed input at the API boundary
    #[error("Invalid request: {field} - {reason}")]
    InvalidRequest { field: String, reason: String },

    /// An operation exceeded its time bound
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Invalid or unreadable configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("JSON error: {message}")]
    Json { message: String },

    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// Failure talking to a remote substation service
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BalancerError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn unknown_substation<S: Into<String>>(substation_id: S) -> Self {
        Self::UnknownSubstation {
            substation_id: substation_id.into(),
        }
    }

    pub fn node_unavailable<S: Into<String>, R: Into<String>>(substation_id: S, reason: R) -> Self {
        Self::NodeUnavailable {
            substation_id: substation_id.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_request<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::InvalidRequest {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// HTTP status returned by the API surface for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DuplicateId { .. } => StatusCode::CONFLICT,
            Self::UnknownSubstation { .. } => StatusCode::NOT_FOUND,
            Self::CapacityExceeded { .. } => StatusCode::CONFLICT,
            Self::InvalidAmount { .. } => StatusCode::BAD_REQUEST,
            Self::NoBackendAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::AllBackendsSaturated { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::AlreadyReleased { .. } => StatusCode::CONFLICT,
            Self::RoutingFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::NodeUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::RequestNotFound { .. } => StatusCode::NOT_FOUND,
            Self::DuplicateRequest { .. } => StatusCode::CONFLICT,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::HttpClient { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the caller may retry the same request later.
    ///
    /// The core itself never retries these; this flag is advice for the
    /// gateway sitting in front of it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoBackendAvailable
                | Self::AllBackendsSaturated { .. }
                | Self::RoutingFailed { .. }
                | Self::NodeUnavailable { .. }
                | Self::Timeout { .. }
                | Self::HttpClient { .. }
        )
    }

    /// Terminal outcome recorded for a request that failed with this error
    pub fn outcome(&self) -> RequestOutcome {
        match self {
            Self::NoBackendAvailable
            | Self::AllBackendsSaturated { .. }
            | Self::CapacityExceeded { .. }
            | Self::InvalidAmount { .. }
            | Self::InvalidRequest { .. }
            | Self::DuplicateRequest { .. } => RequestOutcome::Rejected,
            _ => RequestOutcome::Failed,
        }
    }

    /// Stable machine-readable error type for API responses and metric labels
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::DuplicateId { .. } => "duplicate_id",
            Self::UnknownSubstation { .. } => "unknown_substation",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::InvalidAmount { .. } => "invalid_amount",
            Self::NoBackendAvailable => "no_backend_available",
            Self::AllBackendsSaturated { .. } => "all_backends_saturated",
            Self::AlreadyReleased { .. } => "already_released",
            Self::RoutingFailed { .. } => "routing_failed",
            Self::NodeUnavailable { .. } => "node_unavailable",
            Self::RequestNotFound { .. } => "request_not_found",
            Self::DuplicateRequest { .. } => "duplicate_request",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Timeout { .. } => "timeout",
            Self::Configuration { .. } => "configuration_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::HttpClient { .. } => "http_client_error",
            Self::Internal { .. } => "internal_error",
        }
    }
}

impl From<std::io::Error> for BalancerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BalancerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for BalancerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for BalancerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout { timeout_ms: 0 };
        }
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for BalancerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout { timeout_ms: 0 }
    }
}

/// Structured JSON error body for the API surface
impl IntoResponse for BalancerError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
                "retryable": self.is_retryable(),
            }
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_map_to_service_unavailable() {
        assert_eq!(BalancerError::NoBackendAvailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        let saturated = BalancerError::AllBackendsSaturated { requested: 5, candidates: 3 };
        assert_eq!(saturated.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(saturated.is_retryable());
        assert_eq!(saturated.outcome(), RequestOutcome::Rejected);
    }

    #[test]
    fn test_routing_failed_is_a_failure_outcome() {
        let err = BalancerError::RoutingFailed { attempts: 3, reason: "node down".to_string() };
        assert_eq!(err.outcome(), RequestOutcome::Failed);
        assert_eq!(err.error_type(), "routing_failed");
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_invariant_violations_are_not_retryable() {
        let err = BalancerError::AlreadyReleased { reservation_id: "r-1".to_string() };
        assert!(!err.is_retryable());
        assert!(!BalancerError::DuplicateId { substation_id: "s1".to_string() }.is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: BalancerError = io.into();
        assert_eq!(err.error_type(), "io_error");
    }
}
