//! # Health Monitoring
//!
//! Periodically probes every substation that has a remote URL and feeds the
//! outcome into the registry's health state machine. In-process substations
//! are not probed; their health only changes through `mark_health`.
//!
//! ## Key Features
//! - Pluggable [`HealthProbe`] trait, with an HTTP implementation built on `reqwest`
//! - Every probe bounded by the configured timeout
//! - Probes of one round run concurrently with `futures::future::join_all`
//! - Background loop stopped through a `CancellationToken`

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::HealthConfig;
use crate::core::error::BalancerResult;
use crate::core::types::{HealthState, Substation};
use crate::discovery::SubstationRegistry;

/// Outcome of probing one substation
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub substation_id: String,
    pub success: bool,
    pub message: Option<String>,
    pub duration: Duration,
}

impl ProbeResult {
    pub fn success(substation_id: &str, duration: Duration) -> Self {
        Self {
            substation_id: substation_id.to_string(),
            success: true,
            message: None,
            duration,
        }
    }

    pub fn failure(substation_id: &str, message: String, duration: Duration) -> Self {
        Self {
            substation_id: substation_id.to_string(),
            success: false,
            message: Some(message),
            duration,
        }
    }
}

/// Checks whether one substation is alive
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, substation: &Substation) -> ProbeResult;

    fn probe_type(&self) -> &'static str;
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    #[serde(default)]
    substation_id: Option<String>,
}

/// `GET {url}/health`; a 2xx answer is healthy.
///
/// When the body names a `substation_id`, it must match the registered one.
pub struct HttpHealthProbe {
    client: HttpClient,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> BalancerResult<Self> {
        let client = HttpClient::builder().timeout(timeout).build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, substation: &Substation) -> ProbeResult {
        let start = Instant::now();
        let Some(base) = substation.url.as_deref() else {
            return ProbeResult::failure(&substation.id, "no url to probe".to_string(), start.elapsed());
        };
        let url = format!("{}/health", base.trim_end_matches('/'));

        let result = timeout(self.timeout, self.client.get(&url).send()).await;
        let duration = start.elapsed();

        match result {
            Ok(Ok(response)) => {
                let status = response.status();
                if !status.is_success() {
                    return ProbeResult::failure(
                        &substation.id,
                        format!("Unexpected status code: {}", status.as_u16()),
                        duration,
                    );
                }

                match response.json::<HealthBody>().await {
                    Ok(HealthBody { substation_id: Some(reported) }) if reported != substation.id => {
                        ProbeResult::failure(
                            &substation.id,
                            format!("Probe answered for '{}'", reported),
                            duration,
                        )
                    }
                    _ => ProbeResult::success(&substation.id, duration),
                }
            }
            Ok(Err(e)) => ProbeResult::failure(
                &substation.id,
                format!("HTTP request failed: {}", e),
                duration,
            ),
            Err(_) => ProbeResult::failure(
                &substation.id,
                format!("Health check timed out after {:?}", self.timeout),
                duration,
            ),
        }
    }

    fn probe_type(&self) -> &'static str {
        "http"
    }
}

/// Drives the registry's health state machine from probe results
pub struct HealthMonitor {
    registry: Arc<SubstationRegistry>,
    probe: Arc<dyn HealthProbe>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(registry: Arc<SubstationRegistry>, probe: Arc<dyn HealthProbe>, config: HealthConfig) -> Self {
        Self {
            registry,
            probe,
            config,
        }
    }

    /// Monitor with the HTTP probe and the configured timeout
    pub fn http(registry: Arc<SubstationRegistry>, config: HealthConfig) -> BalancerResult<Self> {
        let probe = Arc::new(HttpHealthProbe::new(config.probe_timeout)?);
        Ok(Self::new(registry, probe, config))
    }

    /// Probe every remote substation once and record the outcomes
    pub async fn probe_once(&self) -> Vec<ProbeResult> {
        let targets: Vec<Substation> = self
            .registry
            .list()
            .into_iter()
            .filter(|snapshot| snapshot.url.is_some())
            .filter_map(|snapshot| self.registry.declaration(&snapshot.id).ok())
            .collect();

        let results = join_all(targets.iter().map(|substation| self.probe.probe(substation))).await;

        for result in &results {
            match self.registry.record_probe(&result.substation_id, result.success) {
                Ok(HealthState::Healthy) => {}
                Ok(state) => debug!(
                    substation_id = %result.substation_id,
                    state = %state,
                    message = result.message.as_deref().unwrap_or(""),
                    duration_ms = result.duration.as_millis() as u64,
                    "Probe recorded"
                ),
                Err(e) => warn!(substation_id = %result.substation_id, error = %e, "Could not record probe"),
            }
        }

        results
    }

    /// Run `probe_once` every probe interval until `shutdown` fires
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                probe = self.probe.probe_type(),
                interval_ms = self.config.probe_interval.as_millis() as u64,
                "Health monitor started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.probe_once().await;
                    }
                }
            }

            info!("Health monitor stopped");
        })
    }
}
