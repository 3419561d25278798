use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hyper::client::HttpConnector;
use hyper::{Body, Client, Request};
use hyper_tls::HttpsConnector;
use tokio::sync::broadcast;

use crate::config::{Config, EndpointConfig, GroupConfig};
use crate::logging::log_health_transition;
use crate::recovery::RecoveryBus;

pub type HttpsClient = Client<HttpsConnector<HttpConnector>>;

/// Latency sentinel for endpoints that have never been measured
const UNKNOWN_LATENCY: u64 = 999_999;

/// Shared upstream client with conservative pooling
pub fn build_https_client() -> HttpsClient {
    let https = HttpsConnector::new();
    Client::builder()
        .pool_idle_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(4)
        .build::<_, Body>(https)
}

/// Runtime view of one upstream endpoint. Health and latency are mutated by
/// the prober and by live traffic; everything else is fixed at config load.
#[derive(Debug)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    pub group: String,
    pub group_priority: u32,
    pub priority: u32,
    pub timeout: Duration,
    token: Option<String>,
    api_key: Option<String>,
    pub headers: HashMap<String, String>,
    pub supports_count_tokens: bool,
    healthy: AtomicBool,
    latency_ms: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl Endpoint {
    fn from_config(config: &EndpointConfig) -> anyhow::Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            url: config.url.trim_end_matches('/').to_string(),
            group: config.group.clone(),
            group_priority: config.group_priority,
            priority: config.priority,
            timeout: config.timeout(),
            token: config.resolved_token()?,
            api_key: config.resolved_api_key()?,
            headers: config.headers.clone(),
            supports_count_tokens: config.supports_count_tokens,
            // Optimistic start; the prober corrects this quickly
            healthy: AtomicBool::new(true),
            latency_ms: AtomicU64::new(UNKNOWN_LATENCY),
            consecutive_failures: AtomicU32::new(0),
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    pub fn record_latency(&self, millis: u64) {
        self.latency_ms.store(millis, Ordering::Relaxed);
    }
}

/// Runtime state of one endpoint group
#[derive(Debug)]
pub struct Group {
    pub name: String,
    pub priority: u32,
    active: AtomicBool,
    cooldown_until: Mutex<Option<Instant>>,
}

impl Group {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}

/// Owns group activation, cooldown bookkeeping and the group-change
/// notification channel.
#[derive(Debug)]
pub struct GroupManager {
    groups: Vec<Arc<Group>>,
    changes: broadcast::Sender<String>,
    config: GroupConfig,
}

impl GroupManager {
    pub fn new(config: &Config) -> Self {
        let mut groups: Vec<Arc<Group>> = Vec::new();
        for endpoint in &config.endpoints {
            if !groups.iter().any(|g| g.name == endpoint.group) {
                groups.push(Arc::new(Group {
                    name: endpoint.group.clone(),
                    priority: endpoint.group_priority,
                    active: AtomicBool::new(false),
                    cooldown_until: Mutex::new(None),
                }));
            }
        }
        groups.sort_by_key(|g| g.priority);

        // The highest-priority group starts active
        if let Some(first) = groups.first() {
            first.active.store(true, Ordering::Relaxed);
        }

        let (changes, _) = broadcast::channel(16);
        Self {
            groups,
            changes,
            config: config.group.clone(),
        }
    }

    pub fn get_all_groups(&self) -> Vec<Arc<Group>> {
        self.groups.clone()
    }

    pub fn auto_switch_enabled(&self) -> bool {
        self.config.auto_switch_between_groups
    }

    fn find(&self, name: &str) -> Option<&Arc<Group>> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn is_group_active(&self, name: &str) -> bool {
        self.find(name).map(|g| g.is_active()).unwrap_or(false)
    }

    pub fn is_group_in_cooldown(&self, name: &str) -> bool {
        let Some(group) = self.find(name) else {
            return false;
        };
        let guard = group.cooldown_until.lock().unwrap_or_else(|e| e.into_inner());
        matches!(*guard, Some(until) if until > Instant::now())
    }

    pub fn subscribe_to_group_changes(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    pub fn filter_endpoints_by_active_groups(
        &self,
        endpoints: &[Arc<Endpoint>],
    ) -> Vec<Arc<Endpoint>> {
        endpoints
            .iter()
            .filter(|endpoint| self.is_group_active(&endpoint.group))
            .cloned()
            .collect()
    }

    /// Activate `name`, deactivating every other group (with cooldown), and
    /// notify group-change subscribers. Returns false for unknown groups.
    pub fn manual_activate_group(&self, name: &str) -> bool {
        if self.find(name).is_none() {
            return false;
        }
        for group in &self.groups {
            if group.name == name {
                group.active.store(true, Ordering::Relaxed);
                let mut guard = group
                    .cooldown_until
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                *guard = None;
            } else if group.is_active() {
                group.active.store(false, Ordering::Relaxed);
                self.apply_cooldown(group);
            }
        }
        let _ = self.changes.send(name.to_string());
        true
    }

    pub fn set_group_cooldown(&self, name: &str) {
        if let Some(group) = self.find(name) {
            self.apply_cooldown(group);
        }
    }

    fn apply_cooldown(&self, group: &Group) {
        let mut guard = group
            .cooldown_until
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *guard = Some(Instant::now() + Duration::from_secs(self.config.cooldown_seconds));
    }

    /// Activate the next inactive, non-cooldown group in priority order.
    /// Used when auto-switch is enabled and the active groups are exhausted.
    pub fn activate_next_group(&self) -> Option<String> {
        let candidate = self
            .groups
            .iter()
            .find(|g| !g.is_active() && !self.is_group_in_cooldown(&g.name))?
            .name
            .clone();
        self.manual_activate_group(&candidate);
        Some(candidate)
    }
}

/// Owns the endpoint set and answers selection queries for the dispatcher.
#[derive(Debug)]
pub struct EndpointManager {
    endpoints: Vec<Arc<Endpoint>>,
    groups: Arc<GroupManager>,
    recovery: Arc<RecoveryBus>,
    failure_threshold: u32,
    probe_client: HttpsClient,
    probe_path: String,
}

impl EndpointManager {
    pub fn new(
        config: &Config,
        groups: Arc<GroupManager>,
        recovery: Arc<RecoveryBus>,
        probe_client: HttpsClient,
    ) -> anyhow::Result<Self> {
        let endpoints = config
            .endpoints
            .iter()
            .map(Endpoint::from_config)
            .collect::<anyhow::Result<Vec<_>>>()?
            .into_iter()
            .map(Arc::new)
            .collect();

        Ok(Self {
            endpoints,
            groups,
            recovery,
            failure_threshold: config.health_check.failure_threshold.max(1),
            probe_client,
            probe_path: config.health_check.path.clone(),
        })
    }

    pub fn get_group_manager(&self) -> Arc<GroupManager> {
        self.groups.clone()
    }

    /// Every configured endpoint, regardless of group or health
    pub fn every_endpoint(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn find(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.name == name).cloned()
    }

    fn sorted(mut endpoints: Vec<Arc<Endpoint>>) -> Vec<Arc<Endpoint>> {
        endpoints.sort_by(|a, b| {
            (a.group_priority, a.priority, a.name.as_str())
                .cmp(&(b.group_priority, b.priority, b.name.as_str()))
        });
        endpoints
    }

    /// Healthy endpoints in active groups, in priority order
    pub fn get_healthy_endpoints(&self) -> Vec<Arc<Endpoint>> {
        let active = self.groups.filter_endpoints_by_active_groups(&self.endpoints);
        Self::sorted(active.into_iter().filter(|e| e.is_healthy()).collect())
    }

    /// All endpoints in active groups ignoring health, in priority order.
    /// The dispatcher's last resort when the healthy set is empty.
    pub fn get_all_endpoints(&self) -> Vec<Arc<Endpoint>> {
        Self::sorted(self.groups.filter_endpoints_by_active_groups(&self.endpoints))
    }

    /// Healthy endpoints ordered by live latency. Probes run concurrently
    /// with a short timeout; unreachable endpoints sink to the end.
    pub async fn get_fastest_endpoints_with_real_time_test(&self) -> Vec<Arc<Endpoint>> {
        let candidates = self.get_healthy_endpoints();
        if candidates.len() < 2 {
            return candidates;
        }

        let probes = candidates.iter().map(|endpoint| {
            let endpoint = endpoint.clone();
            let client = self.probe_client.clone();
            let path = self.probe_path.clone();
            async move {
                let start = Instant::now();
                let latency = match probe_endpoint(&client, &endpoint.url, &path).await {
                    Ok(()) => start.elapsed().as_millis() as u64,
                    Err(_) => UNKNOWN_LATENCY,
                };
                endpoint.record_latency(latency);
            }
        });
        futures::future::join_all(probes).await;

        let mut ordered = candidates;
        ordered.sort_by_key(|endpoint| (endpoint.latency_ms(), endpoint.priority));
        ordered
    }

    pub fn token_for_endpoint<'a>(&self, endpoint: &'a Endpoint) -> Option<&'a str> {
        endpoint.token.as_deref()
    }

    pub fn api_key_for_endpoint<'a>(&self, endpoint: &'a Endpoint) -> Option<&'a str> {
        endpoint.api_key.as_deref()
    }

    /// Record a successful exchange with `name`: resets failure accounting,
    /// restores health, and releases any suspended waiters via the recovery
    /// bus (a success anywhere proves the endpoint works again).
    pub fn record_success(&self, name: &str) {
        if let Some(endpoint) = self.find(name) {
            endpoint.consecutive_failures.store(0, Ordering::Relaxed);
            let was_unhealthy = !endpoint.healthy.swap(true, Ordering::Relaxed);
            if was_unhealthy {
                log_health_transition(name, true, "request succeeded");
            }
        }
        self.recovery.broadcast(name);
    }

    /// Record a failed exchange; the endpoint turns unhealthy after the
    /// configured number of consecutive failures.
    pub fn record_failure(&self, name: &str, detail: &str) {
        if let Some(endpoint) = self.find(name) {
            let failures = endpoint.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= self.failure_threshold
                && endpoint.healthy.swap(false, Ordering::Relaxed)
            {
                log_health_transition(name, false, detail);
            }
        }
    }

    /// Whether an inactive, non-cooldown group still has a healthy endpoint;
    /// the precondition for parking a request instead of failing it.
    pub fn has_standby_capacity(&self) -> bool {
        self.groups.get_all_groups().iter().any(|group| {
            !group.is_active()
                && !self.groups.is_group_in_cooldown(&group.name)
                && self
                    .endpoints
                    .iter()
                    .any(|e| e.group == group.name && e.is_healthy())
        })
    }
}

async fn probe_endpoint(client: &HttpsClient, url: &str, path: &str) -> Result<(), ()> {
    let uri: hyper::Uri = format!("{url}{path}").parse().map_err(|_| ())?;
    let request = Request::get(uri).body(Body::empty()).map_err(|_| ())?;
    let response = tokio::time::timeout(Duration::from_secs(5), client.request(request))
        .await
        .map_err(|_| ())?
        .map_err(|_| ())?;
    // Any response below 500 proves the endpoint is reachable; auth failures
    // on the probe path still mean the service is up
    if response.status().as_u16() < 500 {
        Ok(())
    } else {
        Err(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(toml_text: &str) -> Config {
        toml::from_str(toml_text).unwrap()
    }

    fn two_group_config() -> Config {
        test_config(
            r#"
[server]
port = 8484

[[endpoints]]
name = "main-a"
url = "https://a1.example.com"
group = "main"
group_priority = 1
priority = 1

[[endpoints]]
name = "main-b"
url = "https://a2.example.com"
group = "main"
group_priority = 1
priority = 2

[[endpoints]]
name = "backup-a"
url = "https://b1.example.com"
group = "backup"
group_priority = 2
priority = 1
"#,
        )
    }

    fn build_manager(config: &Config) -> (Arc<EndpointManager>, Arc<GroupManager>, Arc<RecoveryBus>) {
        let groups = Arc::new(GroupManager::new(config));
        let recovery = Arc::new(RecoveryBus::new());
        let manager = Arc::new(
            EndpointManager::new(config, groups.clone(), recovery.clone(), build_https_client())
                .unwrap(),
        );
        (manager, groups, recovery)
    }

    #[test]
    fn test_initial_activation_is_highest_priority_group() {
        let config = two_group_config();
        let (_, groups, _) = build_manager(&config);
        assert!(groups.is_group_active("main"));
        assert!(!groups.is_group_active("backup"));
    }

    #[test]
    fn test_healthy_endpoints_filtered_by_active_group_and_sorted() {
        let config = two_group_config();
        let (manager, _, _) = build_manager(&config);

        let healthy = manager.get_healthy_endpoints();
        let names: Vec<&str> = healthy.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["main-a", "main-b"]);
    }

    #[test]
    fn test_failure_threshold_flips_health() {
        let config = two_group_config();
        let (manager, _, _) = build_manager(&config);

        manager.record_failure("main-a", "connection refused");
        assert!(manager.find("main-a").unwrap().is_healthy());
        manager.record_failure("main-a", "connection refused");
        assert!(!manager.find("main-a").unwrap().is_healthy());

        let names: Vec<String> = manager
            .get_healthy_endpoints()
            .iter()
            .map(|e| e.name.clone())
            .collect();
        assert_eq!(names, vec!["main-b"]);

        // get_all_endpoints ignores health but still honors group activation
        assert_eq!(manager.get_all_endpoints().len(), 2);
    }

    #[tokio::test]
    async fn test_record_success_broadcasts_recovery() {
        let config = two_group_config();
        let (manager, _, recovery) = build_manager(&config);

        let mut subscription = recovery.subscribe("main-a");
        manager.record_failure("main-a", "reset");
        manager.record_failure("main-a", "reset");
        assert!(!manager.find("main-a").unwrap().is_healthy());

        manager.record_success("main-a");
        assert!(manager.find("main-a").unwrap().is_healthy());
        assert_eq!(subscription.recv().await.as_deref(), Some("main-a"));
    }

    #[test]
    fn test_manual_activation_switches_and_notifies() {
        let config = two_group_config();
        let (_, groups, _) = build_manager(&config);

        let mut changes = groups.subscribe_to_group_changes();
        assert!(groups.manual_activate_group("backup"));
        assert!(groups.is_group_active("backup"));
        assert!(!groups.is_group_active("main"));
        // Deactivation puts the old group into cooldown
        assert!(groups.is_group_in_cooldown("main"));
        assert_eq!(changes.try_recv().unwrap(), "backup");

        assert!(!groups.manual_activate_group("nonexistent"));
    }

    #[test]
    fn test_standby_capacity_requires_healthy_inactive_group() {
        let config = two_group_config();
        let (manager, groups, _) = build_manager(&config);

        assert!(manager.has_standby_capacity());

        // A cooled-down standby group does not count
        groups.set_group_cooldown("backup");
        assert!(!manager.has_standby_capacity());
    }

    #[test]
    fn test_standby_capacity_requires_healthy_endpoint() {
        let config = two_group_config();
        let (manager, _, _) = build_manager(&config);

        manager.record_failure("backup-a", "down");
        manager.record_failure("backup-a", "down");
        assert!(!manager.has_standby_capacity());
    }

    #[test]
    fn test_activate_next_group_in_priority_order() {
        let config = two_group_config();
        let (_, groups, _) = build_manager(&config);

        assert_eq!(groups.activate_next_group().as_deref(), Some("backup"));
        assert!(groups.is_group_active("backup"));
        assert!(!groups.is_group_active("main"));
    }
}
