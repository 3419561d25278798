use std::sync::Arc;
use std::time::Instant;

use hyper::{Body, Request};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::HealthCheckConfig;
use crate::endpoints::{EndpointManager, HttpsClient};

/// Periodic liveness prober for every configured endpoint.
///
/// A probe that answers anything below 500 proves the endpoint reachable
/// (auth failures on the probe path still mean the service is up). Health
/// transitions feed the endpoint manager, whose unhealthy→healthy edge
/// broadcasts recovery to suspended requests, so a parked request wakes
/// even when no live traffic touches the endpoint.
pub struct HealthProber {
    config: HealthCheckConfig,
    endpoints: Arc<EndpointManager>,
    client: HttpsClient,
}

impl HealthProber {
    pub fn new(
        config: HealthCheckConfig,
        endpoints: Arc<EndpointManager>,
        client: HttpsClient,
    ) -> Self {
        Self {
            config,
            endpoints,
            client,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        if !self.config.enabled {
            debug!("Health probing disabled by configuration");
            return;
        }

        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.probe_all().await,
            }
        }
    }

    async fn probe_all(&self) {
        let probes = self
            .endpoints
            .every_endpoint()
            .iter()
            .cloned()
            .map(|endpoint| {
                let client = self.client.clone();
                let path = self.config.path.clone();
                let timeout = self.config.timeout();
                let endpoints = self.endpoints.clone();
                async move {
                    let start = Instant::now();
                    match probe_once(&client, &endpoint.url, &path, timeout).await {
                        Ok(status) => {
                            endpoint.record_latency(start.elapsed().as_millis() as u64);
                            endpoints.record_success(&endpoint.name);
                            debug!("Probe {} -> {}", endpoint.name, status);
                        }
                        Err(reason) => {
                            endpoints.record_failure(&endpoint.name, &reason);
                            debug!("Probe {} failed: {}", endpoint.name, reason);
                        }
                    }
                }
            })
            .collect::<Vec<_>>();

        futures::future::join_all(probes).await;
    }
}

async fn probe_once(
    client: &HttpsClient,
    url: &str,
    path: &str,
    timeout: std::time::Duration,
) -> Result<u16, String> {
    let uri: hyper::Uri = format!("{url}{path}")
        .parse()
        .map_err(|e| format!("invalid probe URI: {e}"))?;
    let request = Request::get(uri)
        .body(Body::empty())
        .map_err(|e| format!("probe request build failed: {e}"))?;

    let response = tokio::time::timeout(timeout, client.request(request))
        .await
        .map_err(|_| "probe timed out".to_string())?
        .map_err(|e| format!("probe transport error: {e}"))?;

    let status = response.status().as_u16();
    if status < 500 {
        Ok(status)
    } else {
        Err(format!("probe answered {status}"))
    }
}
