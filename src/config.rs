use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    /// Upstream endpoints, each belonging to a named group
    pub endpoints: Vec<EndpointConfig>,
    /// Retry and backoff behaviour for failed upstream attempts
    #[serde(default)]
    pub retry: RetryConfig,
    /// Request suspension (park-and-recover) behaviour
    #[serde(default)]
    pub suspend: SuspendConfig,
    /// Group failover behaviour
    #[serde(default)]
    pub group: GroupConfig,
    /// Endpoint selection strategy
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Local token counting for /v1/messages/count_tokens
    #[serde(default)]
    pub token_counting: TokenCountingConfig,
    /// Upstream health probing
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Lifecycle event sink
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    /// Bind address, defaults to loopback
    #[serde(default = "default_host")]
    pub host: String,
}

/// A single upstream endpoint serving the Anthropic messages API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Unique display name
    pub name: String,
    /// Base URL, e.g. https://api.anthropic.com
    pub url: String,
    /// Group this endpoint belongs to
    #[serde(default = "default_group_name")]
    pub group: String,
    /// Priority of the group within the failover order (lower wins)
    #[serde(default = "default_priority")]
    pub group_priority: u32,
    /// Priority within the group (lower wins)
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Per-request timeout in seconds
    #[serde(default = "default_endpoint_timeout")]
    pub timeout_seconds: u64,
    /// Bearer token, literal or `env:VAR_NAME`
    #[serde(default)]
    pub token: Option<String>,
    /// x-api-key value, literal or `env:VAR_NAME`
    #[serde(default)]
    pub api_key: Option<String>,
    /// Extra headers applied to every forwarded request
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Whether the endpoint implements /v1/messages/count_tokens
    #[serde(default)]
    pub supports_count_tokens: bool,
}

/// Retry configuration for upstream attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts against a single endpoint (including the first)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between retries in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    /// Classify upstream HTTP 400 as a rate limit (retryable).
    /// Some gateways report quota exhaustion as 400 instead of 429.
    #[serde(default = "default_treat_400_as_rate_limit")]
    pub treat_400_as_rate_limit: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_backoff_multiplier(),
            treat_400_as_rate_limit: default_treat_400_as_rate_limit(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Request suspension configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendConfig {
    /// Park requests instead of failing when all active endpoints are down
    #[serde(default = "default_suspend_enabled")]
    pub enabled: bool,
    /// Maximum time a request may stay suspended, in seconds
    #[serde(default = "default_suspend_timeout")]
    pub timeout_seconds: u64,
    /// Upper bound on concurrently suspended requests
    #[serde(default = "default_max_suspended")]
    pub max_suspended_requests: usize,
}

impl Default for SuspendConfig {
    fn default() -> Self {
        Self {
            enabled: default_suspend_enabled(),
            timeout_seconds: default_suspend_timeout(),
            max_suspended_requests: default_max_suspended(),
        }
    }
}

impl SuspendConfig {
    /// Effective wait bound; a zero configured value falls back to 300s
    pub fn effective_timeout(&self) -> Duration {
        if self.timeout_seconds == 0 {
            Duration::from_secs(300)
        } else {
            Duration::from_secs(self.timeout_seconds)
        }
    }
}

/// Group failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Automatically activate the next group when the active one is exhausted
    #[serde(default)]
    pub auto_switch_between_groups: bool,
    /// Cooldown applied to a group after it is deactivated, in seconds
    #[serde(default = "default_group_cooldown")]
    pub cooldown_seconds: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            auto_switch_between_groups: false,
            cooldown_seconds: default_group_cooldown(),
        }
    }
}

/// Endpoint selection strategy
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StrategyType {
    /// Static priority order from config
    #[default]
    Priority,
    /// Order by observed latency
    Fastest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default, rename = "type")]
    pub strategy_type: StrategyType,
    /// Run a live latency probe before ordering (fastest strategy only)
    #[serde(default)]
    pub fast_test_enabled: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            strategy_type: StrategyType::Priority,
            fast_test_enabled: false,
        }
    }
}

/// Local token counting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCountingConfig {
    #[serde(default = "default_token_counting_enabled")]
    pub enabled: bool,
    /// Characters per estimated token for the local fallback
    #[serde(default = "default_estimation_ratio")]
    pub estimation_ratio: f64,
}

impl Default for TokenCountingConfig {
    fn default() -> Self {
        Self {
            enabled: default_token_counting_enabled(),
            estimation_ratio: default_estimation_ratio(),
        }
    }
}

/// Upstream health probing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    /// Probe interval in seconds
    #[serde(default = "default_health_interval")]
    pub interval_seconds: u64,
    /// Probe timeout in seconds
    #[serde(default = "default_health_timeout")]
    pub timeout_seconds: u64,
    /// Path probed on each endpoint
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Consecutive probe failures before an endpoint is marked unhealthy
    #[serde(default = "default_health_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            interval_seconds: default_health_interval(),
            timeout_seconds: default_health_timeout(),
            path: default_health_path(),
            failure_threshold: default_health_failure_threshold(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Lifecycle event sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Bounded queue capacity; events are dropped (with a warning) when full
    #[serde(default = "default_events_capacity")]
    pub queue_capacity: usize,
    /// Optional JSON-lines output file for lifecycle records
    #[serde(default)]
    pub output_file: Option<String>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_events_capacity(),
            output_file: None,
        }
    }
}

// Default values
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_group_name() -> String {
    "default".to_string()
}
fn default_priority() -> u32 {
    1
}
fn default_endpoint_timeout() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_treat_400_as_rate_limit() -> bool {
    true
}
fn default_suspend_enabled() -> bool {
    false
}
fn default_suspend_timeout() -> u64 {
    300
}
fn default_max_suspended() -> usize {
    100
}
fn default_group_cooldown() -> u64 {
    600
}
fn default_token_counting_enabled() -> bool {
    true
}
fn default_estimation_ratio() -> f64 {
    4.0
}
fn default_health_enabled() -> bool {
    true
}
fn default_health_interval() -> u64 {
    30
}
fn default_health_timeout() -> u64 {
    10
}
fn default_health_path() -> String {
    "/v1/models".to_string()
}
fn default_health_failure_threshold() -> u32 {
    2
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_events_capacity() -> usize {
    1024
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        // Load .env file if it exists
        if Path::new(".env").exists() {
            dotenv::dotenv().ok();
        }

        let content = fs::read_to_string(&path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read config file: {}\nMake sure the file exists and is readable",
                e
            )
        })?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    pub fn load_default() -> anyhow::Result<Self> {
        if Path::new(".env").exists() {
            dotenv::dotenv().ok();
        }

        let config_paths = ["config.toml", "config.toml.template"];

        for path in &config_paths {
            if Path::new(path).exists() {
                tracing::info!("Loading configuration from: {path}");
                return Self::load_from_file(path);
            }
        }

        Err(anyhow::anyhow!(
            "No configuration file found!\n\
             Please create a config.toml file (see config.toml.example)"
        ))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.endpoints.is_empty() {
            return Err(anyhow::anyhow!(
                "No endpoints configured!\nAdd at least one [[endpoints]] entry to config.toml"
            ));
        }

        let mut names = std::collections::HashSet::new();
        for endpoint in &self.endpoints {
            if !names.insert(&endpoint.name) {
                return Err(anyhow::anyhow!(
                    "Duplicate endpoint name '{}'. Each endpoint must have a unique name",
                    endpoint.name
                ));
            }

            let parsed = url::Url::parse(&endpoint.url).map_err(|e| {
                anyhow::anyhow!("Endpoint '{}' has an invalid URL: {}", endpoint.name, e)
            })?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(anyhow::anyhow!(
                    "Endpoint '{}' URL must be http or https",
                    endpoint.name
                ));
            }

            if endpoint.timeout_seconds == 0 {
                return Err(anyhow::anyhow!(
                    "Endpoint '{}' timeout cannot be 0",
                    endpoint.name
                ));
            }

            // Resolve env references eagerly so a missing variable fails at
            // startup instead of on the first forwarded request
            endpoint.resolved_token()?;
            endpoint.resolved_api_key()?;
        }

        if self.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("retry.max_attempts cannot be 0"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(anyhow::anyhow!("retry.multiplier must be >= 1.0"));
        }
        if self.token_counting.estimation_ratio <= 0.0 {
            return Err(anyhow::anyhow!(
                "token_counting.estimation_ratio must be positive"
            ));
        }
        if self.health_check.enabled
            && self.health_check.timeout_seconds >= self.health_check.interval_seconds
        {
            return Err(anyhow::anyhow!(
                "Health probe timeout ({}s) should be less than interval ({}s)",
                self.health_check.timeout_seconds,
                self.health_check.interval_seconds
            ));
        }

        Ok(())
    }

    /// Names of configured groups in failover order
    pub fn group_names(&self) -> Vec<String> {
        let mut groups: Vec<(u32, String)> = Vec::new();
        for endpoint in &self.endpoints {
            if !groups.iter().any(|(_, name)| name == &endpoint.group) {
                groups.push((endpoint.group_priority, endpoint.group.clone()));
            }
        }
        groups.sort_by_key(|(priority, _)| *priority);
        groups.into_iter().map(|(_, name)| name).collect()
    }
}

impl EndpointConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Bearer token with `env:VAR` references resolved
    pub fn resolved_token(&self) -> anyhow::Result<Option<String>> {
        resolve_secret(self.token.as_deref(), &self.name, "token")
    }

    /// x-api-key with `env:VAR` references resolved
    pub fn resolved_api_key(&self) -> anyhow::Result<Option<String>> {
        resolve_secret(self.api_key.as_deref(), &self.name, "api_key")
    }
}

fn resolve_secret(
    value: Option<&str>,
    endpoint_name: &str,
    field: &str,
) -> anyhow::Result<Option<String>> {
    match value {
        None => Ok(None),
        Some(raw) => {
            if let Some(var) = raw.strip_prefix("env:") {
                let resolved = env::var(var).map_err(|_| {
                    anyhow::anyhow!(
                        "Environment variable '{}' referenced by endpoint '{}' {} is not set",
                        var,
                        endpoint_name,
                        field
                    )
                })?;
                Ok(Some(resolved))
            } else {
                Ok(Some(raw.to_string()))
            }
        }
    }
}
