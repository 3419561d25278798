use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::error::{ErrorClassifier, ErrorContext, ErrorKind, RelayError};
use crate::events::{EventSink, LifecycleEvent, LifecycleEventType};
use crate::logging::{log_request_completed, log_request_failed};
use crate::pricing;
use crate::tokens::TokenUsage;

pub const UNKNOWN_MODEL: &str = "unknown";

/// Request status vocabulary. `Completed` is the sole success terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Forwarding,
    Processing,
    Retry,
    Suspended,
    Completed,
    Failed,
    Cancelled,
    NetworkError,
    Timeout,
    AuthError,
    RateLimited,
    StreamError,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Forwarding => "forwarding",
            RequestStatus::Processing => "processing",
            RequestStatus::Retry => "retry",
            RequestStatus::Suspended => "suspended",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::NetworkError => "network_error",
            RequestStatus::Timeout => "timeout",
            RequestStatus::AuthError => "auth_error",
            RequestStatus::RateLimited => "rate_limited",
            RequestStatus::StreamError => "stream_error",
            RequestStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure kind to status tag mapping
pub fn status_for_kind(kind: ErrorKind) -> RequestStatus {
    match kind {
        ErrorKind::Network => RequestStatus::NetworkError,
        ErrorKind::Timeout => RequestStatus::Timeout,
        ErrorKind::Auth => RequestStatus::AuthError,
        ErrorKind::RateLimit => RequestStatus::RateLimited,
        ErrorKind::Stream => RequestStatus::StreamError,
        ErrorKind::ClientCancel => RequestStatus::Cancelled,
        ErrorKind::Http
        | ErrorKind::ServerError
        | ErrorKind::Parsing
        | ErrorKind::NoHealthyEndpoints
        | ErrorKind::Unknown => RequestStatus::Error,
    }
}

#[derive(Debug)]
struct TrackerState {
    start_wall: DateTime<Utc>,
    start_mono: Instant,
    client_ip: String,
    user_agent: String,
    method: String,
    path: String,
    is_streaming: bool,
    model: String,
    endpoint: String,
    group: String,
    status: RequestStatus,
    last_error: Option<String>,
    final_status_code: Option<u16>,
    model_updated: bool,
    prepared: Option<ErrorContext>,
    terminal: bool,
}

/// Per-request lifecycle accounting. One instance per inbound request,
/// shared between the dispatcher and its pipeline tasks; all mutation goes
/// through the internal mutex, the attempt counter is atomic.
#[derive(Debug)]
pub struct LifecycleTracker {
    request_id: String,
    sink: Arc<EventSink>,
    classifier: Arc<ErrorClassifier>,
    attempts: AtomicU32,
    inner: Mutex<TrackerState>,
}

impl LifecycleTracker {
    pub fn new(
        request_id: impl Into<String>,
        sink: Arc<EventSink>,
        classifier: Arc<ErrorClassifier>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            sink,
            classifier,
            attempts: AtomicU32::new(0),
            inner: Mutex::new(TrackerState {
                start_wall: Utc::now(),
                start_mono: Instant::now(),
                client_ip: String::new(),
                user_agent: String::new(),
                method: String::new(),
                path: String::new(),
                is_streaming: false,
                model: UNKNOWN_MODEL.to_string(),
                endpoint: String::new(),
                group: String::new(),
                status: RequestStatus::Pending,
                last_error: None,
                final_status_code: None,
                model_updated: false,
                prepared: None,
                terminal: false,
            }),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event_type: LifecycleEventType, payload: serde_json::Value) {
        self.sink
            .send(LifecycleEvent::new(event_type, &self.request_id, payload));
    }

    pub fn start_request(
        &self,
        client_ip: &str,
        user_agent: &str,
        method: &str,
        path: &str,
        is_streaming: bool,
    ) {
        let payload = {
            let mut state = self.lock();
            state.start_wall = Utc::now();
            state.start_mono = Instant::now();
            state.client_ip = client_ip.to_string();
            state.user_agent = user_agent.to_string();
            state.method = method.to_string();
            state.path = path.to_string();
            state.is_streaming = is_streaming;
            json!({
                "client_ip": client_ip,
                "user_agent": user_agent,
                "method": method,
                "path": path,
                "is_streaming": is_streaming,
                "start_time": state.start_wall.to_rfc3339(),
            })
        };
        self.emit(LifecycleEventType::Start, payload);
    }

    pub fn set_endpoint(&self, endpoint: &str, group: &str) {
        let mut state = self.lock();
        state.endpoint = endpoint.to_string();
        state.group = group.to_string();
    }

    pub fn set_model(&self, model: &str) {
        if model.is_empty() {
            return;
        }
        let mut state = self.lock();
        state.model = model.to_string();
    }

    /// Adopt `model`, warning when it disagrees with a previously known one
    /// (e.g. the request body hint versus the upstream's `message_start`).
    pub fn set_model_with_comparison(&self, model: &str, source: &str) {
        if model.is_empty() {
            return;
        }
        let mut state = self.lock();
        if state.model != UNKNOWN_MODEL && state.model != model {
            warn!(
                "[{}] Model mismatch: tracked '{}' but {} reports '{}'",
                self.request_id, state.model, source, model
            );
        }
        state.model = model.to_string();
    }

    pub fn increment_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get_attempt_count(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Record a status change and emit an update event. `retry_count` of
    /// `None` substitutes the internal attempt counter. The first update
    /// with a known model carries the model so the sink can late-bind it;
    /// later updates stay plain.
    pub fn update_status(
        &self,
        status: RequestStatus,
        retry_count: Option<u32>,
        http_status: u16,
    ) {
        let retry_count = retry_count.unwrap_or_else(|| self.get_attempt_count());
        let payload = {
            let mut state = self.lock();
            if state.terminal {
                return;
            }
            state.status = status;
            if http_status != 0 {
                state.final_status_code = Some(http_status);
            }

            let mut payload = json!({
                "status": status,
                "retry_count": retry_count,
                "http_status": http_status,
                "endpoint": state.endpoint,
                "group": state.group,
            });
            if state.model != UNKNOWN_MODEL && !state.model_updated {
                payload["model"] = json!(state.model);
                state.model_updated = true;
            }
            payload
        };
        self.emit(LifecycleEventType::FlexibleUpdate, payload);
    }

    /// Stash a classification made at the failure boundary so the next
    /// matching `handle_error` call reuses it instead of classifying (and
    /// logging) twice.
    pub fn prepare_error_context(&self, context: ErrorContext) {
        let mut state = self.lock();
        state.prepared = Some(context);
    }

    /// Classify `error` (or adopt a matching prepared context) and record
    /// the mapped status. Returns the context for the caller's retry
    /// decision.
    pub fn handle_error(&self, error: &RelayError, http_status: Option<u16>) -> ErrorContext {
        let context = {
            let mut state = self.lock();
            let prepared = state.prepared.take();
            let context = match prepared {
                Some(prepared) if prepared.matches(error) => prepared,
                Some(_) | None => {
                    // A mismatched prepared context belongs to some other
                    // failure; discard it and classify fresh
                    self.classifier.classify(
                        error,
                        http_status,
                        &self.request_id,
                        &state.endpoint,
                        &state.group,
                        self.get_attempt_count().max(1),
                    )
                }
            };
            state.last_error = Some(context.message.clone());
            context
        };

        warn!(
            "[{}] {} on {}/{} (attempt {}/{}, retry-after {:?}): {}",
            context.request_id,
            context.kind,
            context.group,
            context.endpoint,
            context.attempt,
            context.max_retries,
            context.retry_after,
            context.message
        );

        let status = status_for_kind(context.kind);
        self.update_status(status, None, context.status.unwrap_or(0));
        context
    }

    /// Success terminal: emits the success event with duration, model,
    /// tokens and cost (when pricing is known).
    pub fn complete_request(&self, tokens: Option<&TokenUsage>) {
        let payload = {
            let mut state = self.lock();
            if state.terminal {
                warn!("[{}] Duplicate terminal event suppressed", self.request_id);
                return;
            }
            state.terminal = true;
            state.status = RequestStatus::Completed;

            let duration_ms = state.start_mono.elapsed().as_millis() as u64;
            let mut payload = json!({
                "status": RequestStatus::Completed,
                "duration_ms": duration_ms,
                "model": state.model,
                "endpoint": state.endpoint,
                "group": state.group,
                "path": state.path,
                "is_streaming": state.is_streaming,
                "http_status": state.final_status_code,
                "retry_count": self.get_attempt_count(),
            });
            if let Some(usage) = tokens {
                payload["tokens"] = json!(usage);
                if let Some(model_pricing) = pricing::get_pricing(&state.model) {
                    payload["cost_usd"] = json!(pricing::compute_cost(usage, &model_pricing));
                }
            }
            log_request_completed(&self.request_id, &state.endpoint, duration_ms);
            payload
        };
        self.emit(LifecycleEventType::Success, payload);
    }

    /// Failure terminal: emits the final-failure event. Cancellation also
    /// lands here with `RequestStatus::Cancelled`.
    pub fn fail_request(&self, status: RequestStatus, http_status: u16, reason: &str) {
        let payload = {
            let mut state = self.lock();
            if state.terminal {
                warn!("[{}] Duplicate terminal event suppressed", self.request_id);
                return;
            }
            state.terminal = true;
            state.status = status;
            state.final_status_code = Some(http_status);

            log_request_failed(&self.request_id, http_status, reason);
            json!({
                "status": status,
                "http_status": http_status,
                "reason": reason,
                "duration_ms": state.start_mono.elapsed().as_millis() as u64,
                "endpoint": state.endpoint,
                "group": state.group,
                "client_ip": state.client_ip,
                "user_agent": state.user_agent,
                "method": state.method,
                "path": state.path,
                "retry_count": self.get_attempt_count(),
                "last_error": state.last_error,
            })
        };
        self.emit(LifecycleEventType::FinalFailure, payload);
    }

    /// Complete a response that carried no usage block, labelling it by
    /// body shape.
    pub fn handle_non_token_response(&self, body: &[u8]) {
        let label = classify_non_token_body(body);
        {
            let mut state = self.lock();
            if state.model == UNKNOWN_MODEL {
                state.model = label.to_string();
            }
        }
        self.complete_request(None);
    }

    /// Emit usage parsed before a mid-flight failure, without touching the
    /// request status.
    pub fn record_tokens_for_failed_request(&self, tokens: &TokenUsage, reason: &str) {
        if !tokens.has_any() {
            return;
        }
        let payload = {
            let state = self.lock();
            json!({
                "tokens": tokens,
                "reason": reason,
                "model": state.model,
                "status": state.status,
                "endpoint": state.endpoint,
            })
        };
        self.emit(LifecycleEventType::FailedRequestTokens, payload);
    }

    /// Emit usage salvaged after the fact (partial `message_start` data on a
    /// cancelled stream).
    pub fn record_recovered_tokens(&self, tokens: &TokenUsage, source: &str) {
        if !tokens.has_any() {
            return;
        }
        let payload = {
            let state = self.lock();
            json!({
                "tokens": tokens,
                "source": source,
                "model": state.model,
                "endpoint": state.endpoint,
            })
        };
        self.emit(LifecycleEventType::TokenRecovery, payload);
    }

    pub fn endpoint(&self) -> String {
        self.lock().endpoint.clone()
    }

    pub fn model(&self) -> String {
        self.lock().model.clone()
    }
}

/// Keyword classification for bodies that completed without usage
fn classify_non_token_body(body: &[u8]) -> &'static str {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "empty_response";
    }
    let lower = trimmed.to_lowercase();
    if lower.contains("error") {
        "error_response"
    } else if lower.contains("models") {
        "models_list"
    } else if lower.contains("config") {
        "config_response"
    } else {
        "non_token_response"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EventsConfig, RetryConfig};
    use crate::events::EventSinkWorker;

    fn build_tracker() -> (Arc<LifecycleTracker>, EventSinkWorker) {
        let (sink, worker) = EventSink::new(&EventsConfig {
            queue_capacity: 64,
            output_file: None,
        });
        let classifier = Arc::new(ErrorClassifier::new(RetryConfig::default()));
        let tracker = Arc::new(LifecycleTracker::new("req-1", Arc::new(sink), classifier));
        (tracker, worker)
    }

    #[tokio::test]
    async fn test_event_sequence_start_update_success() {
        let (tracker, mut worker) = build_tracker();
        tracker.start_request("127.0.0.1", "test-agent", "POST", "/v1/messages", true);
        tracker.set_endpoint("main-a", "main");
        tracker.update_status(RequestStatus::Forwarding, None, 0);
        tracker.complete_request(Some(&TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
            ..Default::default()
        }));

        let start = worker.recv().await.unwrap();
        assert_eq!(start.event_type, LifecycleEventType::Start);
        assert_eq!(start.payload["is_streaming"], true);

        let update = worker.recv().await.unwrap();
        assert_eq!(update.event_type, LifecycleEventType::FlexibleUpdate);
        assert_eq!(update.payload["status"], "forwarding");

        let success = worker.recv().await.unwrap();
        assert_eq!(success.event_type, LifecycleEventType::Success);
        assert_eq!(success.payload["tokens"]["input_tokens"], 10);
        assert!(worker.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_exactly_one_terminal_event() {
        let (tracker, mut worker) = build_tracker();
        tracker.complete_request(None);
        tracker.fail_request(RequestStatus::Error, 502, "late failure");
        tracker.complete_request(None);

        let first = worker.recv().await.unwrap();
        assert_eq!(first.event_type, LifecycleEventType::Success);
        assert!(worker.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_updates_after_terminal_are_dropped() {
        let (tracker, mut worker) = build_tracker();
        tracker.fail_request(RequestStatus::Cancelled, 499, "client went away");
        tracker.update_status(RequestStatus::Retry, None, 0);

        let terminal = worker.recv().await.unwrap();
        assert_eq!(terminal.event_type, LifecycleEventType::FinalFailure);
        assert_eq!(terminal.payload["status"], "cancelled");
        assert!(worker.try_recv().is_none());
    }

    #[test]
    fn test_attempt_counter() {
        let (tracker, _worker) = build_tracker();
        assert_eq!(tracker.get_attempt_count(), 0);
        assert_eq!(tracker.increment_attempt(), 1);
        assert_eq!(tracker.increment_attempt(), 2);
        assert_eq!(tracker.get_attempt_count(), 2);
    }

    #[tokio::test]
    async fn test_retry_count_substitution_uses_attempts() {
        let (tracker, mut worker) = build_tracker();
        tracker.increment_attempt();
        tracker.increment_attempt();
        tracker.increment_attempt();
        tracker.update_status(RequestStatus::Suspended, None, 0);

        let update = worker.recv().await.unwrap();
        assert_eq!(update.payload["retry_count"], 3);

        tracker.update_status(RequestStatus::Retry, Some(1), 0);
        let explicit = worker.recv().await.unwrap();
        assert_eq!(explicit.payload["retry_count"], 1);
    }

    #[tokio::test]
    async fn test_model_attached_to_first_update_only() {
        let (tracker, mut worker) = build_tracker();
        tracker.set_model("claude-3-5-sonnet-20241022");
        tracker.update_status(RequestStatus::Processing, None, 200);
        tracker.update_status(RequestStatus::Retry, None, 0);

        let first = worker.recv().await.unwrap();
        assert_eq!(first.payload["model"], "claude-3-5-sonnet-20241022");
        let second = worker.recv().await.unwrap();
        assert!(second.payload.get("model").is_none());
    }

    #[test]
    fn test_model_comparison_adopts_new_value() {
        let (tracker, _worker) = build_tracker();
        tracker.set_model("claude-3-5-sonnet-20241022");
        tracker.set_model_with_comparison("claude-3-5-haiku-20241022", "message_start");
        assert_eq!(tracker.model(), "claude-3-5-haiku-20241022");
    }

    #[tokio::test]
    async fn test_prepared_context_short_circuits_classification() {
        let (tracker, mut worker) = build_tracker();
        let error = RelayError::other("some opaque upstream failure");
        // Prepared says rate limit even though the text would classify
        // Unknown; handle_error must adopt the prepared kind
        let prepared = ErrorContext {
            request_id: "req-1".into(),
            endpoint: "main-a".into(),
            group: "main".into(),
            attempt: 1,
            kind: ErrorKind::RateLimit,
            message: error.to_string(),
            status: Some(429),
            retry_after: std::time::Duration::from_millis(300),
            max_retries: 3,
        };
        tracker.prepare_error_context(prepared);
        let context = tracker.handle_error(&error, None);
        assert_eq!(context.kind, ErrorKind::RateLimit);

        let update = worker.recv().await.unwrap();
        assert_eq!(update.payload["status"], "rate_limited");
        assert_eq!(update.payload["http_status"], 429);
    }

    #[tokio::test]
    async fn test_mismatched_prepared_context_discarded() {
        let (tracker, mut worker) = build_tracker();
        let prepared = ErrorContext {
            request_id: "req-1".into(),
            endpoint: "main-a".into(),
            group: "main".into(),
            attempt: 1,
            kind: ErrorKind::RateLimit,
            message: "a different failure entirely".into(),
            status: Some(429),
            retry_after: std::time::Duration::ZERO,
            max_retries: 3,
        };
        tracker.prepare_error_context(prepared);

        let error = RelayError::other("connection refused");
        let context = tracker.handle_error(&error, None);
        assert_eq!(context.kind, ErrorKind::Network);

        let update = worker.recv().await.unwrap();
        assert_eq!(update.payload["status"], "network_error");
    }

    #[tokio::test]
    async fn test_non_token_response_labels() {
        let (tracker, mut worker) = build_tracker();
        tracker.handle_non_token_response(b"");
        let success = worker.recv().await.unwrap();
        assert_eq!(success.payload["model"], "empty_response");
    }

    #[test]
    fn test_non_token_body_classification() {
        assert_eq!(classify_non_token_body(b"  "), "empty_response");
        assert_eq!(
            classify_non_token_body(br#"{"error":{"type":"x"}}"#),
            "error_response"
        );
        assert_eq!(
            classify_non_token_body(br#"{"data":[],"object":"models"}"#),
            "models_list"
        );
        assert_eq!(
            classify_non_token_body(br#"{"config":{"a":1}}"#),
            "config_response"
        );
        assert_eq!(classify_non_token_body(b"plain text"), "non_token_response");
    }

    #[tokio::test]
    async fn test_failed_tokens_only_with_usage() {
        let (tracker, mut worker) = build_tracker();
        tracker.record_tokens_for_failed_request(&TokenUsage::default(), "stream cut");
        assert!(worker.try_recv().is_none());

        let usage = TokenUsage {
            input_tokens: 5000,
            cache_read_input_tokens: 200,
            ..Default::default()
        };
        tracker.record_tokens_for_failed_request(&usage, "stream cut");
        let event = worker.recv().await.unwrap();
        assert_eq!(event.event_type, LifecycleEventType::FailedRequestTokens);
        assert_eq!(event.payload["tokens"]["input_tokens"], 5000);
    }

    #[tokio::test]
    async fn test_success_carries_cost_for_known_model() {
        let (tracker, mut worker) = build_tracker();
        tracker.set_model("claude-3-5-sonnet-20241022");
        tracker.complete_request(Some(&TokenUsage {
            input_tokens: 1_000_000,
            ..Default::default()
        }));
        let success = worker.recv().await.unwrap();
        assert!((success.payload["cost_usd"].as_f64().unwrap() - 3.0).abs() < 1e-9);
    }
}
