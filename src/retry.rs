use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::ErrorKind;
use crate::lifecycle::RequestStatus;

/// A rate-limit delay above this threshold suggests parking the request
/// instead of sleeping on it.
pub const SUSPEND_DELAY_THRESHOLD: Duration = Duration::from_secs(30);

/// What the dispatcher should do with a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub retry_same_endpoint: bool,
    pub switch_endpoint: bool,
    pub suspend_request: bool,
    /// Terminal status when no further attempts should be made
    pub final_status: Option<RequestStatus>,
    pub delay: Duration,
    pub reason: String,
}

impl RetryDecision {
    fn retry(delay: Duration, reason: impl Into<String>) -> Self {
        Self {
            retry_same_endpoint: true,
            switch_endpoint: false,
            suspend_request: false,
            final_status: None,
            delay,
            reason: reason.into(),
        }
    }

    fn switch(delay: Duration, reason: impl Into<String>) -> Self {
        Self {
            retry_same_endpoint: false,
            switch_endpoint: true,
            suspend_request: false,
            final_status: None,
            delay,
            reason: reason.into(),
        }
    }

    fn terminal(status: RequestStatus, reason: impl Into<String>) -> Self {
        Self {
            retry_same_endpoint: false,
            switch_endpoint: false,
            suspend_request: false,
            final_status: Some(status),
            delay: Duration::ZERO,
            reason: reason.into(),
        }
    }
}

/// Pure decision function from failure kind and attempt counters to the next
/// move. Holds no per-request state.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// `local_attempt` is 1-based and counts attempts against the current
    /// endpoint; `global_attempt` is the request-wide counter, used only for
    /// reporting.
    pub fn decide(
        &self,
        kind: ErrorKind,
        local_attempt: u32,
        global_attempt: u32,
        is_streaming: bool,
    ) -> RetryDecision {
        let max = self.config.max_attempts;
        let exhausted = local_attempt >= max;

        match kind {
            ErrorKind::ClientCancel => {
                RetryDecision::terminal(RequestStatus::Cancelled, "client cancelled the request")
            }

            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::ServerError => {
                if exhausted {
                    RetryDecision::switch(
                        Duration::ZERO,
                        format!("{kind} persisted through {max} attempts, switching endpoint"),
                    )
                } else {
                    RetryDecision::retry(
                        backoff_delay(&self.config, local_attempt),
                        format!("transient {kind} (attempt {local_attempt}/{max}, global {global_attempt})"),
                    )
                }
            }

            ErrorKind::RateLimit => {
                // Rate limits retry through local_attempt == max: the
                // attempt a granted backoff was waiting on still runs
                if local_attempt > max {
                    RetryDecision::switch(
                        Duration::ZERO,
                        format!("rate limited through {max} attempts, switching endpoint"),
                    )
                } else {
                    let delay = rate_limit_delay(&self.config, local_attempt);
                    let mut decision = RetryDecision::retry(
                        delay,
                        format!("rate limited (attempt {local_attempt}/{max})"),
                    );
                    // Past the threshold the wait happens parked, where a
                    // recovery signal can release it early
                    decision.suspend_request = delay > SUSPEND_DELAY_THRESHOLD;
                    decision
                }
            }

            ErrorKind::Http => RetryDecision::terminal(
                RequestStatus::Error,
                "non-retryable upstream client error",
            ),

            ErrorKind::Auth => RetryDecision::terminal(
                RequestStatus::AuthError,
                "authentication rejected by upstream",
            ),

            ErrorKind::Stream => {
                // Headers already committed; bytes may have reached the
                // client, so a replay is unsafe on any transport
                let detail = if is_streaming {
                    "stream failed after bytes were delivered"
                } else {
                    "response stream failed after headers"
                };
                RetryDecision::terminal(RequestStatus::StreamError, detail)
            }

            ErrorKind::Parsing => RetryDecision::switch(
                backoff_delay(&self.config, local_attempt),
                "unparseable response, trying another endpoint",
            ),

            ErrorKind::NoHealthyEndpoints => RetryDecision::switch(
                Duration::ZERO,
                "no healthy endpoints, re-querying the endpoint set",
            ),

            ErrorKind::Unknown => {
                if exhausted {
                    RetryDecision::switch(
                        Duration::ZERO,
                        format!("unclassified error persisted through {max} attempts"),
                    )
                } else {
                    RetryDecision::retry(
                        backoff_delay(&self.config, local_attempt),
                        format!("unclassified error (attempt {local_attempt}/{max})"),
                    )
                }
            }
        }
    }
}

/// base * multiplier^(attempt-1), capped at max_delay. `attempt` is 1-based.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32) as i32;
    let millis = config.base_delay_ms as f64 * config.multiplier.powi(exponent);
    let capped = millis.min(config.max_delay_ms as f64);
    Duration::from_millis(capped as u64)
}

/// (base*3) * 2.5^(attempt-1), capped at twice the normal ceiling.
pub fn rate_limit_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32) as i32;
    let millis = (config.base_delay_ms.saturating_mul(3)) as f64 * 2.5f64.powi(exponent);
    let capped = millis.min((config.max_delay_ms.saturating_mul(2)) as f64);
    Duration::from_millis(capped as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig::default())
    }

    #[test]
    fn test_client_cancel_is_terminal() {
        let decision = policy().decide(ErrorKind::ClientCancel, 1, 1, false);
        assert!(!decision.retry_same_endpoint);
        assert!(!decision.switch_endpoint);
        assert_eq!(decision.final_status, Some(RequestStatus::Cancelled));
    }

    #[test]
    fn test_network_retries_then_switches() {
        let policy = policy();
        for attempt in 1..3 {
            let decision = policy.decide(ErrorKind::Network, attempt, attempt, false);
            assert!(decision.retry_same_endpoint, "attempt {attempt}");
            assert!(decision.delay > Duration::ZERO);
        }
        let exhausted = policy.decide(ErrorKind::Network, 3, 3, false);
        assert!(!exhausted.retry_same_endpoint);
        assert!(exhausted.switch_endpoint);
    }

    #[test]
    fn test_timeout_and_server_error_follow_network_shape() {
        let policy = policy();
        for kind in [ErrorKind::Timeout, ErrorKind::ServerError] {
            assert!(policy.decide(kind, 1, 1, false).retry_same_endpoint);
            assert!(policy.decide(kind, 3, 7, false).switch_endpoint);
        }
    }

    #[test]
    fn test_rate_limit_uses_harder_backoff() {
        let config = RetryConfig {
            base_delay_ms: 100,
            ..RetryConfig::default()
        };
        let policy = RetryPolicy::new(config);
        let d1 = policy.decide(ErrorKind::RateLimit, 1, 1, false);
        let d2 = policy.decide(ErrorKind::RateLimit, 2, 2, false);
        let d3 = policy.decide(ErrorKind::RateLimit, 3, 3, false);
        assert_eq!(d1.delay, Duration::from_millis(300));
        assert_eq!(d2.delay, Duration::from_millis(750));
        assert_eq!(d3.delay, Duration::from_millis(1875));
        assert!(!d1.suspend_request);
        // Unlike transport failures, the attempt the backoff was buying is
        // still granted at local_attempt == max_attempts
        assert!(d3.retry_same_endpoint);
        assert!(policy.decide(ErrorKind::RateLimit, 4, 4, false).switch_endpoint);
    }

    #[test]
    fn test_rate_limit_long_delay_suggests_suspension() {
        let config = RetryConfig {
            base_delay_ms: 20_000,
            max_delay_ms: 120_000,
            ..RetryConfig::default()
        };
        let policy = RetryPolicy::new(config);
        // (20s*3) * 2.5^0 = 60s > 30s threshold
        let decision = policy.decide(ErrorKind::RateLimit, 1, 1, false);
        assert!(decision.retry_same_endpoint);
        assert!(decision.suspend_request);
    }

    #[test]
    fn test_http_auth_stream_are_terminal() {
        let policy = policy();
        assert_eq!(
            policy.decide(ErrorKind::Http, 1, 1, false).final_status,
            Some(RequestStatus::Error)
        );
        assert_eq!(
            policy.decide(ErrorKind::Auth, 1, 1, false).final_status,
            Some(RequestStatus::AuthError)
        );
        assert_eq!(
            policy.decide(ErrorKind::Stream, 1, 1, true).final_status,
            Some(RequestStatus::StreamError)
        );
    }

    #[test]
    fn test_parsing_switches_immediately() {
        let decision = policy().decide(ErrorKind::Parsing, 1, 1, false);
        assert!(!decision.retry_same_endpoint);
        assert!(decision.switch_endpoint);
        assert!(decision.delay > Duration::ZERO);
    }

    #[test]
    fn test_no_healthy_endpoints_switches_without_delay() {
        let decision = policy().decide(ErrorKind::NoHealthyEndpoints, 1, 1, false);
        assert!(decision.switch_endpoint);
        assert_eq!(decision.delay, Duration::ZERO);
    }

    #[test]
    fn test_unknown_retries_until_exhaustion() {
        let policy = policy();
        assert!(policy.decide(ErrorKind::Unknown, 1, 1, false).retry_same_endpoint);
        assert!(policy.decide(ErrorKind::Unknown, 3, 3, false).switch_endpoint);
    }

    #[test]
    fn test_backoff_monotonic_up_to_cap() {
        let config = RetryConfig::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..=10 {
            let delay = backoff_delay(&config, attempt);
            assert!(delay >= previous);
            assert!(delay <= config.max_delay());
            previous = delay;
        }
        assert_eq!(backoff_delay(&config, 10), config.max_delay());
    }
}
