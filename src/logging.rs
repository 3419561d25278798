use tracing::{info, warn};

/// Log categories for better visual distinction
pub mod log_cat {
    pub const PROXY: &str = "🔄";
    pub const SWITCH: &str = "🔀";
    pub const SERVER: &str = "🚀";
    pub const CONFIG: &str = "⚙️";
    pub const ERROR: &str = "❌";
    pub const SUCCESS: &str = "✅";
    pub const RETRY: &str = "🔁";
    pub const SUSPEND: &str = "⏸️";
    pub const HEALTH: &str = "🏥";
}

pub fn log_server_start(host: &str, port: u16) {
    info!("{} Relay listening on {}:{}", log_cat::SERVER, host, port);
}

pub fn log_server_error(error: &str) {
    tracing::error!("{} Server error: {}", log_cat::ERROR, error);
}

pub fn log_config_loaded(endpoint_count: usize, group_count: usize) {
    info!(
        "{} Configuration loaded: {} endpoints in {} groups",
        log_cat::CONFIG,
        endpoint_count,
        group_count
    );
}

pub fn log_forward(request_id: &str, endpoint: &str, attempt: u32) {
    info!(
        "{} [{}] Forwarding to {} (attempt {})",
        log_cat::PROXY,
        request_id,
        endpoint,
        attempt
    );
}

pub fn log_retry_scheduled(request_id: &str, endpoint: &str, attempt: u32, delay_ms: u64) {
    info!(
        "{} [{}] Retrying {} in {}ms (attempt {})",
        log_cat::RETRY,
        request_id,
        endpoint,
        delay_ms,
        attempt
    );
}

pub fn log_retry_exhausted(request_id: &str, endpoint: &str, attempts: u32) {
    warn!(
        "{} [{}] Endpoint {} exhausted after {} attempts",
        log_cat::RETRY,
        request_id,
        endpoint,
        attempts
    );
}

pub fn log_endpoint_switch(request_id: &str, from: &str, to: &str) {
    info!(
        "{} [{}] Switching endpoint {} → {}",
        log_cat::SWITCH,
        request_id,
        from,
        to
    );
}

pub fn log_request_suspended(request_id: &str, endpoint: &str, suspended_count: usize) {
    info!(
        "{} [{}] Request suspended waiting for {} ({} suspended total)",
        log_cat::SUSPEND,
        request_id,
        endpoint,
        suspended_count
    );
}

pub fn log_request_resumed(request_id: &str, reason: &str) {
    info!(
        "{} [{}] Request resumed: {}",
        log_cat::SUCCESS,
        request_id,
        reason
    );
}

pub fn log_request_completed(request_id: &str, endpoint: &str, duration_ms: u64) {
    info!(
        "{} [{}] Completed via {} in {}ms",
        log_cat::SUCCESS,
        request_id,
        endpoint,
        duration_ms
    );
}

pub fn log_request_failed(request_id: &str, status: u16, reason: &str) {
    warn!(
        "{} [{}] Failed with {}: {}",
        log_cat::ERROR,
        request_id,
        status,
        reason
    );
}

pub fn log_health_transition(endpoint: &str, healthy: bool, detail: &str) {
    if healthy {
        info!("{} {} is healthy ({})", log_cat::HEALTH, endpoint, detail);
    } else {
        warn!("{} {} is unhealthy ({})", log_cat::HEALTH, endpoint, detail);
    }
}

pub fn log_event_dropped(dropped_total: u64) {
    warn!(
        "{} Event sink queue full, lifecycle event dropped ({} dropped so far)",
        log_cat::ERROR,
        dropped_total
    );
}
