use std::time::Duration;

use thiserror::Error;

use crate::config::RetryConfig;

/// Failures observed while forwarding a request upstream.
///
/// Variants carry enough structure for classification; everything else is
/// classified from the error text.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("client disconnected")]
    ClientDisconnected,

    #[error("request to {endpoint} timed out after {seconds}s")]
    Timeout { endpoint: String, seconds: u64 },

    #[error("no healthy endpoints available")]
    NoHealthyEndpoints,

    #[error("HTTP {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("response parsing failed: {0}")]
    Parsing(String),

    #[error(transparent)]
    Transport(#[from] hyper::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    pub fn other(message: impl Into<String>) -> Self {
        RelayError::Other(message.into())
    }

    /// Upstream HTTP status carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            RelayError::UpstreamStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Classified failure category. Ordering of the classifier's checks matters:
/// cancellation dominates timeout, timeout dominates connection errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Timeout,
    /// Non-retryable upstream 4xx (other than 400/401/403/429)
    Http,
    /// Upstream 5xx
    ServerError,
    /// Mid-stream failure after headers were committed
    Stream,
    Auth,
    RateLimit,
    Parsing,
    ClientCancel,
    NoHealthyEndpoints,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Http => "http",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Stream => "stream",
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Parsing => "parsing",
            ErrorKind::ClientCancel => "client_cancel",
            ErrorKind::NoHealthyEndpoints => "no_healthy_endpoints",
            ErrorKind::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Classification result carried from the failure boundary to the retry
/// policy and the lifecycle tracker. Classified exactly once per failure.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub request_id: String,
    pub endpoint: String,
    pub group: String,
    pub attempt: u32,
    pub kind: ErrorKind,
    /// Original error text; also the identity key for prepared contexts
    pub message: String,
    pub status: Option<u16>,
    pub retry_after: Duration,
    pub max_retries: u32,
}

impl ErrorContext {
    /// Whether this prepared context belongs to `error`.
    ///
    /// True when the error renders to the same text, or wraps it (the
    /// wrapper's message contains the original).
    pub fn matches(&self, error: &RelayError) -> bool {
        let message = error.to_string();
        message == self.message || message.contains(&self.message)
    }
}

/// Maps raw errors and upstream statuses to an [`ErrorContext`].
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    retry: RetryConfig,
}

impl ErrorClassifier {
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    pub fn classify(
        &self,
        error: &RelayError,
        status: Option<u16>,
        request_id: &str,
        endpoint: &str,
        group: &str,
        attempt: u32,
    ) -> ErrorContext {
        let kind = self.classify_kind(error, status);
        ErrorContext {
            request_id: request_id.to_string(),
            endpoint: endpoint.to_string(),
            group: group.to_string(),
            attempt,
            kind,
            message: error.to_string(),
            status: status.or_else(|| error.status()),
            retry_after: self.suggested_retry_after(kind, attempt),
            max_retries: self.retry.max_attempts,
        }
    }

    /// Classification priority: cancellation, then timeout, then network,
    /// then upstream status, then stream/parse text, then unknown.
    pub fn classify_kind(&self, error: &RelayError, status: Option<u16>) -> ErrorKind {
        match error {
            RelayError::ClientDisconnected => return ErrorKind::ClientCancel,
            RelayError::NoHealthyEndpoints => return ErrorKind::NoHealthyEndpoints,
            _ => {}
        }

        let message = error.to_string().to_lowercase();

        if is_cancellation(error, &message) {
            return ErrorKind::ClientCancel;
        }
        if is_timeout(error, &message) {
            return ErrorKind::Timeout;
        }
        if is_network(error, &message) {
            return ErrorKind::Network;
        }

        let status = status.or_else(|| error.status());
        if let Some(code) = status {
            if code == 429 || (code == 400 && self.retry.treat_400_as_rate_limit) {
                return ErrorKind::RateLimit;
            }
            if code == 401 || code == 403 {
                return ErrorKind::Auth;
            }
            if (500..600).contains(&code) {
                return ErrorKind::ServerError;
            }
            if (400..500).contains(&code) {
                return ErrorKind::Http;
            }
        }

        if matches!(error, RelayError::Stream(_)) || message.contains("stream") {
            return ErrorKind::Stream;
        }
        if matches!(error, RelayError::Parsing(_)) || message.contains("parse") {
            return ErrorKind::Parsing;
        }

        ErrorKind::Unknown
    }

    /// Suggested delay before the next attempt for a failure of `kind`.
    /// `attempt` is 1-based.
    pub fn suggested_retry_after(&self, kind: ErrorKind, attempt: u32) -> Duration {
        match kind {
            ErrorKind::Network
            | ErrorKind::Timeout
            | ErrorKind::ServerError
            | ErrorKind::Stream
            | ErrorKind::Parsing => self.backoff(attempt),
            ErrorKind::RateLimit => self.rate_limit_backoff(attempt),
            ErrorKind::Auth | ErrorKind::Http | ErrorKind::ClientCancel => Duration::ZERO,
            ErrorKind::NoHealthyEndpoints => Duration::ZERO,
            ErrorKind::Unknown => {
                if attempt < 2 {
                    self.backoff(attempt)
                } else {
                    Duration::ZERO
                }
            }
        }
    }

    /// base * multiplier^(attempt-1), capped at max_delay
    pub fn backoff(&self, attempt: u32) -> Duration {
        crate::retry::backoff_delay(&self.retry, attempt)
    }

    /// Rate limits back off harder: (base*3) * 2.5^(attempt-1), capped at
    /// twice the normal ceiling
    pub fn rate_limit_backoff(&self, attempt: u32) -> Duration {
        crate::retry::rate_limit_delay(&self.retry, attempt)
    }
}

fn is_cancellation(error: &RelayError, message: &str) -> bool {
    if let RelayError::Transport(e) = error {
        if e.is_canceled() {
            return true;
        }
    }
    message.contains("context canceled") || message.contains("client disconnected")
}

fn is_timeout(error: &RelayError, message: &str) -> bool {
    match error {
        RelayError::Timeout { .. } => return true,
        RelayError::Transport(e) if e.is_timeout() => return true,
        RelayError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => return true,
        _ => {}
    }
    message.contains("timeout") || message.contains("i/o timeout") || message.contains("deadline")
}

fn is_network(error: &RelayError, message: &str) -> bool {
    match error {
        RelayError::Transport(e)
            if e.is_connect() || e.is_closed() || e.is_incomplete_message() =>
        {
            return true
        }
        RelayError::Io(e) => {
            use std::io::ErrorKind as IoKind;
            if matches!(
                e.kind(),
                IoKind::ConnectionRefused
                    | IoKind::ConnectionReset
                    | IoKind::ConnectionAborted
                    | IoKind::NotConnected
                    | IoKind::BrokenPipe
                    | IoKind::UnexpectedEof
                    | IoKind::AddrNotAvailable
            ) {
                return true;
            }
        }
        _ => {}
    }
    message.contains("connection refused")
        || message.contains("connection reset")
        || message.contains("network is unreachable")
        || message.contains("no route to host")
        || message.contains("broken pipe")
        || message.contains("unexpected eof")
        || message.contains("eof")
        || message.contains("dns error")
        || message.contains("failed to lookup")
}

/// Loose network fingerprint used by the stream pipeline to decide whether a
/// pre-byte setup failure is worth replaying.
pub fn is_network_fingerprint(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("timeout")
        || message.contains("timed out")
        || message.contains("connection")
        || message.contains("reset")
        || message.contains("refused")
        || message.contains("network")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new(RetryConfig::default())
    }

    fn classify(error: &RelayError, status: Option<u16>) -> ErrorKind {
        classifier().classify_kind(error, status)
    }

    #[test]
    fn test_cancellation_dominates_timeout() {
        let error = RelayError::other("connection timeout: context canceled");
        assert_eq!(classify(&error, None), ErrorKind::ClientCancel);
    }

    #[test]
    fn test_timeout_dominates_connection() {
        let error = RelayError::other("connection i/o timeout");
        assert_eq!(classify(&error, None), ErrorKind::Timeout);
    }

    #[test]
    fn test_network_patterns() {
        for text in [
            "connection refused",
            "connection reset by peer",
            "network is unreachable",
            "no route to host",
            "broken pipe",
            "unexpected EOF",
        ] {
            let error = RelayError::other(text);
            assert_eq!(classify(&error, None), ErrorKind::Network, "{text}");
        }
    }

    #[test]
    fn test_io_error_kinds_are_network() {
        let error = RelayError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(classify(&error, None), ErrorKind::Network);
    }

    #[test]
    fn test_status_mapping() {
        let error = RelayError::UpstreamStatus {
            status: 0,
            message: String::new(),
        };
        assert_eq!(classify(&error, Some(429)), ErrorKind::RateLimit);
        assert_eq!(classify(&error, Some(400)), ErrorKind::RateLimit);
        assert_eq!(classify(&error, Some(401)), ErrorKind::Auth);
        assert_eq!(classify(&error, Some(403)), ErrorKind::Auth);
        assert_eq!(classify(&error, Some(500)), ErrorKind::ServerError);
        assert_eq!(classify(&error, Some(503)), ErrorKind::ServerError);
        assert_eq!(classify(&error, Some(404)), ErrorKind::Http);
        assert_eq!(classify(&error, Some(422)), ErrorKind::Http);
    }

    #[test]
    fn test_400_toggle_maps_to_http() {
        let retry = RetryConfig {
            treat_400_as_rate_limit: false,
            ..RetryConfig::default()
        };
        let classifier = ErrorClassifier::new(retry);
        let error = RelayError::UpstreamStatus {
            status: 400,
            message: "bad request".into(),
        };
        assert_eq!(classifier.classify_kind(&error, Some(400)), ErrorKind::Http);
    }

    #[test]
    fn test_stream_and_parsing_text() {
        assert_eq!(
            classify(&RelayError::Stream("cut".into()), None),
            ErrorKind::Stream
        );
        assert_eq!(
            classify(&RelayError::Parsing("bad json".into()), None),
            ErrorKind::Parsing
        );
        assert_eq!(
            classify(&RelayError::other("failed to parse usage block"), None),
            ErrorKind::Parsing
        );
    }

    #[test]
    fn test_sentinels() {
        assert_eq!(
            classify(&RelayError::NoHealthyEndpoints, None),
            ErrorKind::NoHealthyEndpoints
        );
        assert_eq!(
            classify(&RelayError::ClientDisconnected, None),
            ErrorKind::ClientCancel
        );
        assert_eq!(
            classify(&RelayError::other("something odd happened"), None),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let classifier = classifier();
        let mut previous = Duration::ZERO;
        for attempt in 1..=12 {
            let delay = classifier.backoff(attempt);
            assert!(delay >= previous, "attempt {attempt}");
            assert!(delay <= classifier.retry.max_delay());
            previous = delay;
        }
    }

    #[test]
    fn test_rate_limit_backoff_progression() {
        let retry = RetryConfig {
            base_delay_ms: 100,
            ..RetryConfig::default()
        };
        let classifier = ErrorClassifier::new(retry);
        assert_eq!(
            classifier.rate_limit_backoff(1),
            Duration::from_millis(300)
        );
        assert_eq!(
            classifier.rate_limit_backoff(2),
            Duration::from_millis(750)
        );
        assert_eq!(
            classifier.rate_limit_backoff(3),
            Duration::from_millis(1875)
        );
    }

    #[test]
    fn test_retry_after_zero_for_terminal_kinds() {
        let classifier = classifier();
        for kind in [
            ErrorKind::Auth,
            ErrorKind::Http,
            ErrorKind::ClientCancel,
            ErrorKind::NoHealthyEndpoints,
        ] {
            assert_eq!(
                classifier.suggested_retry_after(kind, 1),
                Duration::ZERO,
                "{kind}"
            );
        }
    }

    #[test]
    fn test_unknown_backs_off_only_early() {
        let classifier = classifier();
        assert!(classifier.suggested_retry_after(ErrorKind::Unknown, 1) > Duration::ZERO);
        assert_eq!(
            classifier.suggested_retry_after(ErrorKind::Unknown, 2),
            Duration::ZERO
        );
    }

    #[test]
    fn test_prepared_context_matching() {
        let classifier = classifier();
        let original = RelayError::other("connection reset by peer");
        let ctx = classifier.classify(&original, None, "req-1", "ep", "g", 1);
        assert!(ctx.matches(&original));

        let wrapper = RelayError::Stream(format!("forwarding failed: {original}"));
        assert!(ctx.matches(&wrapper));

        let unrelated = RelayError::other("some other failure");
        assert!(!ctx.matches(&unrelated));
    }
}
