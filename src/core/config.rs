//! # Configuration Module
//!
//! Startup configuration for the balancer. Everything here is read once and
//! is immutable afterwards; substation capacities are not hot-reloadable.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Human-readable durations (`"5s"`, `"250ms"`) via `humantime_serde`
//! - Environment variable overrides (`BALANCER_*`)
//! - Validation that reports every problem at once

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::core::error::{BalancerError, BalancerResult};
use crate::core::types::Substation;

/// Complete balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// HTTP surface of the balancer
    pub server: ServerConfig,

    /// Substations known at startup
    pub substations: Vec<SubstationConfig>,

    /// Health probing and state machine thresholds
    pub health: HealthConfig,

    /// Admission retry policy
    pub routing: RoutingConfig,

    /// Session and request bookkeeping
    pub sessions: SessionConfig,

    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

impl BalancerConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> BalancerResult<Self> {
        let content = tokio::fs::read_to_string(path).await
            .map_err(|e| BalancerError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: BalancerConfig = serde_yaml::from_str(&content)
            .map_err(|e| BalancerError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from JSON
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> BalancerResult<Self> {
        let content = tokio::fs::read_to_string(path).await
            .map_err(|e| BalancerError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: BalancerConfig = serde_json::from_str(&content)
            .map_err(|e| BalancerError::config(format!("Failed to parse JSON config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise start from defaults.
    ///
    /// Environment overrides and validation apply in both cases, so a
    /// container can be configured entirely through `BALANCER_*` variables.
    pub async fn load_or_default<P: AsRef<Path>>(path: P) -> BalancerResult<Self> {
        let path = path.as_ref();
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return match path.extension().and_then(|ext| ext.to_str()) {
                Some("json") => Self::load_from_json(path).await,
                _ => Self::load_from_file(path).await,
            };
        }

        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> BalancerResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    ///
    /// Variables follow the pattern `BALANCER_<FIELD>`. `BALANCER_SUBSTATIONS`
    /// replaces the substation list with a comma-separated list of
    /// `id=capacity` or `id=capacity@url` entries.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> BalancerResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("BALANCER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Some(port) = lookup("BALANCER_PORT") {
            self.server.port = port.parse()
                .map_err(|e| BalancerError::config(format!("Invalid BALANCER_PORT: {}", e)))?;
        }

        if let Some(list) = lookup("BALANCER_SUBSTATIONS") {
            self.substations = parse_substation_list(&list)?;
        }

        if let Some(threshold) = lookup("BALANCER_FAILURE_THRESHOLD") {
            self.health.failure_threshold = threshold.parse()
                .map_err(|e| BalancerError::config(format!("Invalid BALANCER_FAILURE_THRESHOLD: {}", e)))?;
        }

        if let Some(threshold) = lookup("BALANCER_RECOVERY_THRESHOLD") {
            self.health.recovery_threshold = threshold.parse()
                .map_err(|e| BalancerError::config(format!("Invalid BALANCER_RECOVERY_THRESHOLD: {}", e)))?;
        }

        if let Some(interval) = lookup("BALANCER_PROBE_INTERVAL") {
            self.health.probe_interval = humantime::parse_duration(&interval)
                .map_err(|e| BalancerError::config(format!("Invalid BALANCER_PROBE_INTERVAL: {}", e)))?;
        }

        if let Some(timeout) = lookup("BALANCER_PROBE_TIMEOUT") {
            self.health.probe_timeout = humantime::parse_duration(&timeout)
                .map_err(|e| BalancerError::config(format!("Invalid BALANCER_PROBE_TIMEOUT: {}", e)))?;
        }

        if let Some(attempts) = lookup("BALANCER_MAX_ATTEMPTS") {
            self.routing.max_attempts = attempts.parse()
                .map_err(|e| BalancerError::config(format!("Invalid BALANCER_MAX_ATTEMPTS: {}", e)))?;
        }

        if let Some(timeout) = lookup("BALANCER_SESSION_START_TIMEOUT") {
            self.routing.session_start_timeout = humantime::parse_duration(&timeout)
                .map_err(|e| BalancerError::config(format!("Invalid BALANCER_SESSION_START_TIMEOUT: {}", e)))?;
        }

        if let Some(level) = lookup("BALANCER_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Some(format) = lookup("BALANCER_LOG_FORMAT") {
            self.observability.logging.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => return Err(BalancerError::config(format!("Invalid BALANCER_LOG_FORMAT: {}", other))),
            };
        }

        if let Some(enabled) = lookup("BALANCER_METRICS_ENABLED") {
            self.observability.metrics.enabled = enabled.parse()
                .map_err(|e| BalancerError::config(format!("Invalid BALANCER_METRICS_ENABLED: {}", e)))?;
        }

        Ok(())
    }

    /// Validate the whole configuration, collecting every error
    pub fn validate(&self) -> BalancerResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("bind_address cannot be empty".to_string());
        }

        if self.substations.is_empty() {
            errors.push("at least one substation must be configured".to_string());
        }

        let mut seen = HashSet::new();
        for (index, substation) in self.substations.iter().enumerate() {
            if substation.id.trim().is_empty() {
                errors.push(format!("Substation {} has empty id", index));
            } else if !seen.insert(substation.id.as_str()) {
                errors.push(format!("Duplicate substation id: {}", substation.id));
            }

            if substation.max_capacity == 0 {
                errors.push(format!("Substation '{}' max_capacity must be greater than 0", substation.id));
            }

            if let Some(url) = &substation.url {
                if let Err(e) = Url::parse(url) {
                    errors.push(format!("Substation '{}' has invalid url '{}': {}", substation.id, url, e));
                }
            }
        }

        if self.health.failure_threshold == 0 {
            errors.push("health failure_threshold must be greater than 0".to_string());
        }

        if self.health.recovery_threshold == 0 {
            errors.push("health recovery_threshold must be greater than 0".to_string());
        }

        if self.health.probe_interval.is_zero() {
            errors.push("health probe_interval must be greater than 0".to_string());
        }

        if self.health.probe_timeout.is_zero() {
            errors.push("health probe_timeout must be greater than 0".to_string());
        }

        if self.routing.max_attempts == 0 {
            errors.push("routing max_attempts must be greater than 0".to_string());
        }

        if self.routing.session_start_timeout.is_zero() {
            errors.push("routing session_start_timeout must be greater than 0".to_string());
        }

        if self.sessions.poll_interval.is_zero() {
            errors.push("sessions poll_interval must be greater than 0".to_string());
        }

        if self.sessions.reconcile_interval.is_zero() {
            errors.push("sessions reconcile_interval must be greater than 0".to_string());
        }

        if let Err(reason) = check_metrics_path(&self.observability.metrics.endpoint_path) {
            errors.push(format!(
                "Invalid metrics endpoint_path '{}': {}",
                self.observability.metrics.endpoint_path, reason
            ));
        }

        match self.observability.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => errors.push(format!("Invalid log level: {}", self.observability.logging.level)),
        }

        if !errors.is_empty() {
            return Err(BalancerError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }

    /// Substation declarations for the registry
    pub fn substation_declarations(&self) -> Vec<Substation> {
        self.substations.iter().map(SubstationConfig::to_substation).collect()
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            substations: vec![
                SubstationConfig::new("substation1", 150),
                SubstationConfig::new("substation2", 120),
                SubstationConfig::new("substation3", 100),
            ],
            health: HealthConfig::default(),
            routing: RoutingConfig::default(),
            sessions: SessionConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// The scrape path shares a router with the API, so it must be a plain
/// absolute path that none of the fixed routes claim.
fn check_metrics_path(path: &str) -> Result<(), &'static str> {
    if !path.starts_with('/') || path.len() < 2 {
        return Err("must start with '/' and name a path");
    }
    if path.contains(':') || path.contains('*') {
        return Err("must not contain route parameters");
    }
    if path == "/health" || path == "/api" || path.starts_with("/api/") {
        return Err("collides with a built-in route");
    }
    Ok(())
}

/// Parse `id=capacity[@url]` entries separated by commas
fn parse_substation_list(list: &str) -> BalancerResult<Vec<SubstationConfig>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, rest) = entry.split_once('=').ok_or_else(|| {
                BalancerError::config(format!("Invalid BALANCER_SUBSTATIONS entry '{}': expected id=capacity", entry))
            })?;
            let (capacity, url) = match rest.split_once('@') {
                Some((capacity, url)) => (capacity, Some(url.trim().to_string())),
                None => (rest, None),
            };
            let max_capacity = capacity.trim().parse().map_err(|e| {
                BalancerError::config(format!("Invalid capacity in BALANCER_SUBSTATIONS entry '{}': {}", entry, e))
            })?;
            Ok(SubstationConfig {
                id: id.trim().to_string(),
                max_capacity,
                url,
            })
        })
        .collect()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5002,
        }
    }
}

/// One substation entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstationConfig {
    pub id: String,
    pub max_capacity: u64,
    /// Remote substation service; omitted for in-process substations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl SubstationConfig {
    pub fn new(id: impl Into<String>, max_capacity: u64) -> Self {
        Self {
            id: id.into(),
            max_capacity,
            url: None,
        }
    }

    pub fn to_substation(&self) -> Substation {
        Substation {
            id: self.id.clone(),
            max_capacity: self.max_capacity,
            url: self.url.clone(),
        }
    }
}

/// Health probing configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failed probes before `Degraded` becomes `Unreachable`
    pub failure_threshold: u32,

    /// Consecutive successful probes before a substation is `Healthy` again
    pub recovery_threshold: u32,

    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 1,
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Routing retry policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Hand-off attempts per request before `RoutingFailed`
    pub max_attempts: u32,

    /// Bound on waiting for a node to acknowledge a session
    #[serde(with = "humantime_serde")]
    pub session_start_timeout: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            session_start_timeout: Duration::from_secs(10),
        }
    }
}

/// Session bookkeeping
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Finished sessions kept per substation node
    pub history_limit: usize,

    /// Finished requests kept by the balancer
    pub request_history_limit: usize,

    /// How often remote session status is polled
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How often finished requests are swept out of the active map
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: 10,
            request_history_limit: 20,
            poll_interval: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(30),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub endpoint_path: String,
    /// Histogram buckets for `balancer_assignment_duration_seconds`
    pub assignment_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint_path: "/metrics".to_string(),
            assignment_buckets: vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::fs;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_validation() {
        let config = BalancerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.substations.len(), 3);
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.routing.max_attempts, 3);
    }

    #[test]
    fn test_config_serialization_yaml() {
        let config = BalancerConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: BalancerConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.substations, deserialized.substations);
        assert_eq!(config.health.probe_interval, deserialized.health.probe_interval);
    }

    #[tokio::test]
    async fn test_load_config_from_yaml_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("balancer.yaml");

        let config_content = r#"
server:
  bind_address: "127.0.0.1"
  port: 6002

substations:
  - id: "north"
    max_capacity: 200
  - id: "south"
    max_capacity: 80
    url: "http://south:5003"

health:
  failure_threshold: 5
  probe_interval: "2s"
  probe_timeout: "500ms"

routing:
  max_attempts: 4
  session_start_timeout: "3s"

observability:
  logging:
    level: "debug"
    format: "text"
"#;

        fs::write(&config_path, config_content).await.unwrap();

        let config = BalancerConfig::load_from_file(&config_path).await.unwrap();

        assert_eq!(config.server.port, 6002);
        assert_eq!(config.substations.len(), 2);
        assert_eq!(config.substations[1].url.as_deref(), Some("http://south:5003"));
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.health.recovery_threshold, 1);
        assert_eq!(config.health.probe_timeout, Duration::from_millis(500));
        assert_eq!(config.routing.max_attempts, 4);
        assert_eq!(config.observability.logging.format, LogFormat::Text);
        assert_eq!(config.sessions.history_limit, 10);
    }

    #[tokio::test]
    async fn test_load_config_from_json_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("balancer.json");

        let config_content = r#"{
  "substations": [
    { "id": "a", "max_capacity": 10 },
    { "id": "b", "max_capacity": 20 }
  ],
  "routing": { "max_attempts": 2, "session_start_timeout": "1s" }
}"#;

        fs::write(&config_path, config_content).await.unwrap();

        let config = BalancerConfig::load_from_json(&config_path).await.unwrap();
        assert_eq!(config.substations.len(), 2);
        assert_eq!(config.routing.max_attempts, 2);
        assert_eq!(config.server.port, 5002);
    }

    #[tokio::test]
    async fn test_load_or_default_without_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = BalancerConfig::load_or_default(temp_dir.path().join("missing.yaml"))
            .await
            .unwrap();
        assert!(!config.substations.is_empty());
    }

    #[test]
    fn test_overrides() {
        let mut config = BalancerConfig::default();
        config
            .apply_overrides_from(lookup_from(&[
                ("BALANCER_PORT", "7000"),
                ("BALANCER_SUBSTATIONS", "s1=50, s2=75@http://s2:5003"),
                ("BALANCER_FAILURE_THRESHOLD", "4"),
                ("BALANCER_PROBE_INTERVAL", "750ms"),
                ("BALANCER_LOG_FORMAT", "text"),
            ]))
            .unwrap();

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.substations.len(), 2);
        assert_eq!(config.substations[0], SubstationConfig::new("s1", 50));
        assert_eq!(config.substations[1].url.as_deref(), Some("http://s2:5003"));
        assert_eq!(config.health.failure_threshold, 4);
        assert_eq!(config.health.probe_interval, Duration::from_millis(750));
        assert_eq!(config.observability.logging.format, LogFormat::Text);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_overrides() {
        let mut config = BalancerConfig::default();
        let result = config.apply_overrides_from(lookup_from(&[("BALANCER_PORT", "not-a-port")]));
        assert!(result.unwrap_err().to_string().contains("Invalid BALANCER_PORT"));

        let result = config.apply_overrides_from(lookup_from(&[("BALANCER_SUBSTATIONS", "s1")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_collects_errors() {
        let mut config = BalancerConfig::default();
        config.substations = vec![
            SubstationConfig::new("dup", 10),
            SubstationConfig::new("dup", 0),
            SubstationConfig {
                id: "bad-url".to_string(),
                max_capacity: 5,
                url: Some("not a url".to_string()),
            },
        ];
        config.routing.max_attempts = 0;

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("Duplicate substation id: dup"));
        assert!(message.contains("max_capacity must be greater than 0"));
        assert!(message.contains("invalid url"));
        assert!(message.contains("max_attempts"));
    }

    #[test]
    fn test_empty_substation_list_is_invalid() {
        let mut config = BalancerConfig::default();
        config.substations.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_metrics_path_must_not_shadow_routes() {
        for path in ["metrics", "/", "/health", "/api", "/api/metrics", "/metrics/:id"] {
            let mut config = BalancerConfig::default();
            config.observability.metrics.endpoint_path = path.to_string();
            let message = config.validate().unwrap_err().to_string();
            assert!(message.contains("metrics endpoint_path"), "accepted {}", path);
        }

        let mut config = BalancerConfig::default();
        config.observability.metrics.endpoint_path = "/prometheus".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_reconcile_interval_is_invalid() {
        let mut config = BalancerConfig::default();
        config.sessions.reconcile_interval = Duration::ZERO;
        assert!(config.validate().unwrap_err().to_string().contains("reconcile_interval"));
    }
}
