use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffered::{BodyAnalysis, BufferedPipeline};
use crate::config::{Config, StrategyType};
use crate::endpoints::{Endpoint, EndpointManager, HttpsClient};
use crate::error::{ErrorClassifier, RelayError};
use crate::events::EventSink;
use crate::lifecycle::{LifecycleTracker, RequestStatus};
use crate::logging::{log_endpoint_switch, log_forward, log_retry_exhausted, log_retry_scheduled};
use crate::retry::RetryPolicy;
use crate::stream::StreamPipeline;
use crate::suspension::{SuspensionManager, SuspensionResult};

/// Global counter for unique request IDs
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn generate_request_id() -> String {
    let counter = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(1_700_000_000))
        .as_millis();
    format!("req_{timestamp}_{counter}")
}

/// Hop-by-hop headers stripped before forwarding
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Flat token cost charged per tool definition in the local estimate
const TOOL_TOKEN_COST: u64 = 400;
/// Fixed request overhead in the local estimate
const REQUEST_TOKEN_OVERHEAD: u64 = 50;

/// Cap on retained upstream error bodies
const MAX_ERROR_BODY: usize = 64 * 1024;

/// How one pass over the endpoint set ended.
enum DispatchOutcome {
    /// Buffered response ready for the client
    Buffered(crate::buffered::BufferedOutcome),
    /// Streaming response fully relayed (success, cancel or API error); the
    /// wire already carries the outcome
    StreamingDone,
    /// Terminal failure
    Failed {
        status: RequestStatus,
        code: u16,
        reason: String,
        upstream_body: Option<Bytes>,
    },
}

/// Per-request orchestrator: endpoint selection, forwarding, retry policy,
/// suspension and lifecycle accounting.
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<Config>,
    client: HttpsClient,
    endpoints: Arc<EndpointManager>,
    classifier: Arc<ErrorClassifier>,
    policy: RetryPolicy,
    suspension: Arc<SuspensionManager>,
    sink: Arc<EventSink>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        client: HttpsClient,
        endpoints: Arc<EndpointManager>,
        suspension: Arc<SuspensionManager>,
        sink: Arc<EventSink>,
    ) -> Self {
        let classifier = Arc::new(ErrorClassifier::new(config.retry.clone()));
        let policy = RetryPolicy::new(config.retry.clone());
        Self {
            config,
            client,
            endpoints,
            classifier,
            policy,
            suspension,
            sink,
        }
    }

    /// Entry point for every proxied request.
    pub async fn dispatch(&self, req: Request<Body>, client_ip: String) -> Response<Body> {
        let request_id = generate_request_id();
        let (parts, body) = req.into_parts();
        let method = parts.method.clone();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let path = parts.uri.path().to_string();
        let user_agent = header_str(&parts.headers, "user-agent").unwrap_or_default();

        let body = match hyper::body::to_bytes(body).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("[{request_id}] Failed to read request body: {e}");
                return simple_response(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };

        if path == "/v1/messages/count_tokens" && self.config.token_counting.enabled {
            return self
                .handle_count_tokens(&request_id, &method, &path_and_query, &parts.headers, body)
                .await;
        }

        let is_streaming = detect_sse(&parts.headers, &body);

        let tracker = Arc::new(LifecycleTracker::new(
            &request_id,
            self.sink.clone(),
            self.classifier.clone(),
        ));
        tracker.start_request(
            &client_ip,
            &user_agent,
            method.as_str(),
            &path,
            is_streaming,
        );

        // Best-effort model hint from the request body, off the hot path
        if path.starts_with("/v1/messages") {
            spawn_model_hint(tracker.clone(), body.clone());
        }

        let cancel = CancellationToken::new();

        if is_streaming {
            self.dispatch_streaming(
                tracker,
                cancel,
                body,
                method,
                path_and_query,
                parts.headers,
            )
        } else {
            self.dispatch_buffered(&tracker, &cancel, &body, &method, &path_and_query, &parts.headers)
                .await
        }
    }

    /// Streaming requests commit a 200 SSE response immediately; everything
    /// after that (including failures) travels as SSE frames.
    fn dispatch_streaming(
        &self,
        tracker: Arc<LifecycleTracker>,
        cancel: CancellationToken,
        body: Bytes,
        method: Method,
        path_and_query: String,
        client_headers: HeaderMap,
    ) -> Response<Body> {
        let (mut sender, client_body) = Body::channel();
        let dispatcher = self.clone();
        let request_id = tracker.request_id().to_string();

        tokio::spawn(async move {
            let outcome = dispatcher
                .run_attempts(
                    &tracker,
                    &cancel,
                    &body,
                    &method,
                    &path_and_query,
                    &client_headers,
                    Some(&mut sender),
                )
                .await;

            if let DispatchOutcome::Failed { status, reason, .. } = outcome {
                let kind = if status == RequestStatus::Cancelled {
                    "cancelled"
                } else {
                    "error"
                };
                send_control_frame(&mut sender, kind, &reason).await;
            }
            // Dropping the sender terminates the client stream
        });

        let response = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/event-stream")
            .header("cache-control", "no-cache")
            .header("connection", "keep-alive")
            .header("x-request-id", request_id)
            .body(client_body);
        response.unwrap_or_else(|_| {
            simple_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed")
        })
    }

    async fn dispatch_buffered(
        &self,
        tracker: &Arc<LifecycleTracker>,
        cancel: &CancellationToken,
        body: &Bytes,
        method: &Method,
        path_and_query: &str,
        client_headers: &HeaderMap,
    ) -> Response<Body> {
        let outcome = self
            .run_attempts(
                tracker,
                cancel,
                body,
                method,
                path_and_query,
                client_headers,
                None,
            )
            .await;

        match outcome {
            DispatchOutcome::Buffered(buffered) => {
                let mut builder = Response::builder()
                    .status(StatusCode::from_u16(buffered.status).unwrap_or(StatusCode::OK));
                if let Some(headers) = builder.headers_mut() {
                    *headers = buffered.headers;
                    headers.insert(
                        "x-request-id",
                        HeaderValue::from_str(tracker.request_id())
                            .unwrap_or(HeaderValue::from_static("unknown")),
                    );
                }
                builder.body(Body::from(buffered.body)).unwrap_or_else(|_| {
                    simple_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed")
                })
            }
            DispatchOutcome::StreamingDone => {
                // Unreachable on the buffered path
                simple_response(StatusCode::INTERNAL_SERVER_ERROR, "unexpected streaming outcome")
            }
            DispatchOutcome::Failed {
                status,
                code,
                reason,
                upstream_body,
            } => error_response(code, status, &reason, upstream_body),
        }
    }

    /// The outer endpoint loop with the inner per-endpoint attempt loop.
    /// `client_sender` present means the SSE path: bytes flow to the client
    /// as they arrive and failures surface as frames, not status codes.
    #[allow(clippy::too_many_arguments)]
    async fn run_attempts(
        &self,
        tracker: &Arc<LifecycleTracker>,
        cancel: &CancellationToken,
        body: &Bytes,
        method: &Method,
        path_and_query: &str,
        client_headers: &HeaderMap,
        mut client_sender: Option<&mut hyper::body::Sender>,
    ) -> DispatchOutcome {
        let request_id = tracker.request_id().to_string();
        let mut health_fallback_used = false;
        let mut last_upstream_body: Option<Bytes> = None;

        'select_endpoints: loop {
            let mut candidates = self.select_endpoints().await;

            if candidates.is_empty() {
                // One shot at the full active set ignoring health before
                // giving up on endpoint selection entirely
                if !health_fallback_used {
                    health_fallback_used = true;
                    tracker.handle_error(&RelayError::NoHealthyEndpoints, None);
                    candidates = self.endpoints.get_all_endpoints();
                    debug!(
                        "[{request_id}] No healthy endpoints, falling back to {} active endpoints",
                        candidates.len()
                    );
                }
                if candidates.is_empty() {
                    tracker.fail_request(
                        RequestStatus::Error,
                        503,
                        "no endpoints available in active groups",
                    );
                    return DispatchOutcome::Failed {
                        status: RequestStatus::Error,
                        code: 503,
                        reason: "no endpoints available in active groups".to_string(),
                        upstream_body: None,
                    };
                }
            }

            let mut previous_endpoint: Option<String> = None;

            for endpoint in &candidates {
                if let Some(previous) = &previous_endpoint {
                    log_endpoint_switch(&request_id, previous, &endpoint.name);
                }
                previous_endpoint = Some(endpoint.name.clone());
                tracker.set_endpoint(&endpoint.name, &endpoint.group);

                // Attempt bounds are owned by the retry policy: the loop
                // only exits on a switch/terminal/suspend decision
                let mut attempt = 0;
                loop {
                    attempt += 1;

                    if cancel.is_cancelled() {
                        tracker.fail_request(RequestStatus::Cancelled, 499, "client cancelled");
                        return DispatchOutcome::Failed {
                            status: RequestStatus::Cancelled,
                            code: 499,
                            reason: "client cancelled".to_string(),
                            upstream_body: None,
                        };
                    }

                    let global_attempt = tracker.increment_attempt();
                    tracker.update_status(RequestStatus::Forwarding, None, 0);
                    log_forward(&request_id, &endpoint.name, global_attempt);

                    let attempt_error = match self
                        .forward_once(endpoint, method, path_and_query, client_headers, body.clone())
                        .await
                    {
                        Ok(response) if response.status().is_success() => {
                            let status = response.status().as_u16();
                            tracker.update_status(RequestStatus::Processing, None, status);

                            match &mut client_sender {
                                Some(sender) => {
                                    match self
                                        .relay_stream(tracker, cancel, response, sender)
                                        .await
                                    {
                                        Ok(outcome) => return outcome,
                                        Err(error) => error,
                                    }
                                }
                                None => match BufferedPipeline::process(response).await {
                                    Ok(buffered) => {
                                        self.endpoints.record_success(&endpoint.name);
                                        self.finish_buffered(tracker, &buffered);
                                        return DispatchOutcome::Buffered(buffered);
                                    }
                                    Err(error) => error,
                                },
                            }
                        }
                        Ok(response) => {
                            let status = response.status().as_u16();
                            let snippet = read_error_body(response).await;
                            last_upstream_body = Some(snippet.clone());
                            RelayError::UpstreamStatus {
                                status,
                                message: String::from_utf8_lossy(
                                    &snippet[..snippet.len().min(256)],
                                )
                                .to_string(),
                            }
                        }
                        Err(error) => error,
                    };

                    // Classify once, record, and consult the policy
                    let http_status = attempt_error.status();
                    let context = tracker.handle_error(&attempt_error, http_status);
                    self.endpoints.record_failure(&endpoint.name, &context.message);

                    let decision = self.policy.decide(
                        context.kind,
                        attempt,
                        tracker.get_attempt_count(),
                        client_sender.is_some(),
                    );
                    debug!(
                        "[{request_id}] {} attempt {} -> {}",
                        endpoint.name, attempt, decision.reason
                    );

                    if let Some(final_status) = decision.final_status {
                        let code = context
                            .status
                            .unwrap_or_else(|| default_code_for(final_status));
                        tracker.fail_request(final_status, code, &decision.reason);
                        return DispatchOutcome::Failed {
                            status: final_status,
                            code,
                            reason: decision.reason,
                            upstream_body: last_upstream_body.take(),
                        };
                    }

                    if decision.suspend_request && self.suspension.should_suspend() {
                        match self
                            .suspend_and_wait(tracker, cancel, &endpoint.name, &mut client_sender)
                            .await
                        {
                            Ok(()) => continue 'select_endpoints,
                            Err(outcome) => return outcome,
                        }
                    }

                    if decision.retry_same_endpoint {
                        tracker.update_status(RequestStatus::Retry, None, 0);
                        if let Some(sender) = &mut client_sender {
                            send_control_frame(
                                sender,
                                "retry",
                                &format!("attempt {} on {}", attempt + 1, endpoint.name),
                            )
                            .await;
                        }
                        log_retry_scheduled(
                            &request_id,
                            &endpoint.name,
                            attempt + 1,
                            decision.delay.as_millis() as u64,
                        );
                        if !sleep_unless_cancelled(decision.delay, cancel).await {
                            tracker.fail_request(
                                RequestStatus::Cancelled,
                                499,
                                "client cancelled during retry delay",
                            );
                            return DispatchOutcome::Failed {
                                status: RequestStatus::Cancelled,
                                code: 499,
                                reason: "client cancelled during retry delay".to_string(),
                                upstream_body: None,
                            };
                        }
                        continue;
                    }

                    // switch_endpoint
                    if attempt >= self.policy.max_attempts() {
                        log_retry_exhausted(&request_id, &endpoint.name, attempt);
                    }
                    if decision.delay > Duration::ZERO
                        && !sleep_unless_cancelled(decision.delay, cancel).await
                    {
                        tracker.fail_request(RequestStatus::Cancelled, 499, "client cancelled");
                        return DispatchOutcome::Failed {
                            status: RequestStatus::Cancelled,
                            code: 499,
                            reason: "client cancelled".to_string(),
                            upstream_body: None,
                        };
                    }
                    break;
                }
            }

            // Every candidate is exhausted. Either auto-switch to the next
            // group, park the request, or give up.
            if self.endpoints.get_group_manager().auto_switch_enabled() {
                if let Some(group) = self.endpoints.get_group_manager().activate_next_group() {
                    debug!("[{request_id}] Auto-activated group {group}");
                    continue 'select_endpoints;
                }
            }

            if self.suspension.should_suspend() {
                let waited_for = previous_endpoint.unwrap_or_default();
                match self
                    .suspend_and_wait(tracker, cancel, &waited_for, &mut client_sender)
                    .await
                {
                    Ok(()) => continue 'select_endpoints,
                    Err(outcome) => return outcome,
                }
            }

            tracker.update_status(RequestStatus::Error, None, 502);
            tracker.fail_request(RequestStatus::Error, 502, "all endpoints failed");
            return DispatchOutcome::Failed {
                status: RequestStatus::Error,
                code: 502,
                reason: "all endpoints failed".to_string(),
                upstream_body: last_upstream_body,
            };
        }
    }

    /// Relay a committed 2xx SSE response. `Ok` means the request reached a
    /// terminal state on the wire; `Err` hands a classifiable failure back
    /// to the attempt loop (only safe before any byte went out).
    async fn relay_stream(
        &self,
        tracker: &Arc<LifecycleTracker>,
        cancel: &CancellationToken,
        response: Response<Body>,
        sender: &mut hyper::body::Sender,
    ) -> Result<DispatchOutcome, RelayError> {
        let endpoint_name = tracker.endpoint();
        let pipeline = StreamPipeline::new();
        let outcome = pipeline.run(response.into_body(), sender, cancel).await;

        if let Some(model) = &outcome.model {
            tracker.set_model_with_comparison(model, "message_start");
        }

        let replay_safe = outcome.replay_safe();
        match outcome.error {
            None => {
                if let Some((error_type, message)) = &outcome.api_error {
                    if outcome.has_usage {
                        tracker.record_tokens_for_failed_request(&outcome.tokens, "api_error");
                    }
                    tracker.fail_request(
                        RequestStatus::Error,
                        200,
                        &format!("upstream API error {error_type}: {message}"),
                    );
                    return Ok(DispatchOutcome::StreamingDone);
                }

                self.endpoints.record_success(&endpoint_name);
                if outcome.has_usage {
                    tracker.complete_request(Some(&outcome.tokens));
                } else {
                    tracker.complete_request(None);
                }
                Ok(DispatchOutcome::StreamingDone)
            }

            Some(RelayError::ClientDisconnected) => {
                if outcome.has_usage {
                    tracker.record_recovered_tokens(&outcome.tokens, "partial_stream");
                }
                send_control_frame(sender, "cancelled", "client closed the stream").await;
                tracker.fail_request(RequestStatus::Cancelled, 499, "client cancelled mid-stream");
                Ok(DispatchOutcome::StreamingDone)
            }

            Some(error) => {
                if replay_safe {
                    // Nothing reached the client; let the attempt loop treat
                    // this like any other transport failure
                    return Err(error);
                }
                if outcome.has_usage {
                    tracker.record_tokens_for_failed_request(&outcome.tokens, "stream_interrupted");
                }
                // Classified here, where byte accounting is known; the
                // tracker reuses this context instead of re-classifying
                let wrapped = RelayError::Stream(format!(
                    "stream interrupted after {} bytes: {error}",
                    outcome.bytes_sent
                ));
                let context = self.classifier.classify(
                    &wrapped,
                    None,
                    tracker.request_id(),
                    &endpoint_name,
                    "",
                    tracker.get_attempt_count().max(1),
                );
                tracker.prepare_error_context(context);
                Err(wrapped)
            }
        }
    }

    fn finish_buffered(
        &self,
        tracker: &Arc<LifecycleTracker>,
        buffered: &crate::buffered::BufferedOutcome,
    ) {
        match &buffered.analysis {
            BodyAnalysis::Tokens { usage, model } => {
                if let Some(model) = model {
                    tracker.set_model_with_comparison(model, "response body");
                }
                tracker.complete_request(Some(usage));
            }
            BodyAnalysis::ApiError {
                error_type,
                message,
            } => {
                tracker.fail_request(
                    RequestStatus::Error,
                    buffered.status,
                    &format!("upstream API error {error_type}: {message}"),
                );
            }
            BodyAnalysis::NonToken => {
                tracker.handle_non_token_response(&buffered.body);
            }
        }
    }

    async fn suspend_and_wait(
        &self,
        tracker: &Arc<LifecycleTracker>,
        cancel: &CancellationToken,
        failed_endpoint: &str,
        client_sender: &mut Option<&mut hyper::body::Sender>,
    ) -> Result<(), DispatchOutcome> {
        tracker.update_status(RequestStatus::Suspended, None, 0);
        if let Some(sender) = client_sender {
            send_control_frame(
                sender,
                "suspend",
                &format!("waiting for {failed_endpoint} to recover"),
            )
            .await;
        }

        let result = self
            .suspension
            .wait_for_endpoint_recovery(cancel, tracker.request_id(), failed_endpoint)
            .await;

        match result {
            SuspensionResult::Success => {
                if let Some(sender) = client_sender {
                    send_control_frame(sender, "resume", "endpoint recovered").await;
                }
                tracker.update_status(RequestStatus::Forwarding, None, 0);
                Ok(())
            }
            SuspensionResult::Timeout => {
                tracker.fail_request(RequestStatus::Error, 502, "suspension timed out");
                Err(DispatchOutcome::Failed {
                    status: RequestStatus::Error,
                    code: 502,
                    reason: "suspension timed out".to_string(),
                    upstream_body: None,
                })
            }
            SuspensionResult::Cancelled => {
                tracker.fail_request(RequestStatus::Cancelled, 499, "cancelled while suspended");
                Err(DispatchOutcome::Failed {
                    status: RequestStatus::Cancelled,
                    code: 499,
                    reason: "cancelled while suspended".to_string(),
                    upstream_body: None,
                })
            }
        }
    }

    async fn select_endpoints(&self) -> Vec<Arc<Endpoint>> {
        if self.config.strategy.strategy_type == StrategyType::Fastest
            && self.config.strategy.fast_test_enabled
        {
            self.endpoints.get_fastest_endpoints_with_real_time_test().await
        } else {
            self.endpoints.get_healthy_endpoints()
        }
    }

    async fn forward_once(
        &self,
        endpoint: &Endpoint,
        method: &Method,
        path_and_query: &str,
        client_headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Body>, RelayError> {
        let request = self.build_upstream_request(
            endpoint,
            method,
            path_and_query,
            client_headers,
            body,
        )?;

        match tokio::time::timeout(endpoint.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(RelayError::Transport(e)),
            Err(_) => Err(RelayError::Timeout {
                endpoint: endpoint.name.clone(),
                seconds: endpoint.timeout.as_secs(),
            }),
        }
    }

    fn build_upstream_request(
        &self,
        endpoint: &Endpoint,
        method: &Method,
        path_and_query: &str,
        client_headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Request<Body>, RelayError> {
        let uri: hyper::Uri = format!("{}{}", endpoint.url, path_and_query)
            .parse()
            .map_err(|e| RelayError::other(format!("invalid upstream URI: {e}")))?;

        let host = uri.authority().map(|a| a.to_string()).unwrap_or_default();

        let mut builder = Request::builder().method(method.clone()).uri(uri);
        let headers = builder
            .headers_mut()
            .ok_or_else(|| RelayError::other("request builder in error state"))?;

        *headers = filter_forward_headers(client_headers);

        if let Ok(value) = HeaderValue::from_str(&host) {
            headers.insert("host", value);
        }

        if let Some(token) = self.endpoints.token_for_endpoint(endpoint) {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert("authorization", value);
            }
        }
        if let Some(api_key) = self.endpoints.api_key_for_endpoint(endpoint) {
            if let Ok(value) = HeaderValue::from_str(api_key) {
                headers.insert("x-api-key", value);
            }
        }

        for (name, value) in &endpoint.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        builder
            .body(Body::from(body))
            .map_err(|e| RelayError::other(format!("request build failed: {e}")))
    }

    /// Count-tokens mini-flow: forward to a supporting endpoint when one
    /// exists, otherwise answer with the local character-ratio estimate.
    async fn handle_count_tokens(
        &self,
        request_id: &str,
        method: &Method,
        path_and_query: &str,
        client_headers: &HeaderMap,
        body: Bytes,
    ) -> Response<Body> {
        let supporting: Vec<Arc<Endpoint>> = self
            .endpoints
            .get_all_endpoints()
            .into_iter()
            .filter(|endpoint| endpoint.supports_count_tokens)
            .collect();

        for endpoint in &supporting {
            match self
                .forward_once(endpoint, method, path_and_query, client_headers, body.clone())
                .await
            {
                Ok(response) if response.status().is_success() => {
                    self.endpoints.record_success(&endpoint.name);
                    match BufferedPipeline::process(response).await {
                        Ok(outcome) => {
                            let mut builder = Response::builder().status(
                                StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::OK),
                            );
                            if let Some(headers) = builder.headers_mut() {
                                *headers = outcome.headers;
                            }
                            if let Ok(response) = builder.body(Body::from(outcome.body)) {
                                return response;
                            }
                        }
                        Err(e) => {
                            debug!("[{request_id}] count_tokens body read failed on {}: {e}", endpoint.name);
                        }
                    }
                }
                Ok(response) => {
                    debug!(
                        "[{request_id}] count_tokens on {} answered {}",
                        endpoint.name,
                        response.status()
                    );
                }
                Err(e) => {
                    self.endpoints.record_failure(&endpoint.name, &e.to_string());
                    debug!("[{request_id}] count_tokens on {} failed: {e}", endpoint.name);
                }
            }
        }

        let estimate = estimate_tokens(&body, self.config.token_counting.estimation_ratio);
        let payload = json!({ "input_tokens": estimate });
        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .header("x-token-estimation", "true")
            .body(Body::from(payload.to_string()))
            .unwrap_or_else(|_| {
                simple_response(StatusCode::INTERNAL_SERVER_ERROR, "response build failed")
            })
    }
}

/// SSE detection: explicit Accept, cache hints, the `stream` header, or a
/// `"stream": true` field in the JSON body.
pub fn detect_sse(headers: &HeaderMap, body: &[u8]) -> bool {
    if header_str(headers, "accept")
        .map(|accept| accept.contains("text/event-stream"))
        .unwrap_or(false)
    {
        return true;
    }
    if header_str(headers, "cache-control")
        .map(|value| value.contains("no-cache"))
        .unwrap_or(false)
    {
        return true;
    }
    if header_str(headers, "stream")
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
    {
        return true;
    }
    let text = String::from_utf8_lossy(&body[..body.len().min(4096)]);
    text.contains("\"stream\":true") || text.contains("\"stream\": true")
}

/// Local token estimate: characters across message and system content
/// divided by the configured ratio, plus flat costs per tool and request.
pub fn estimate_tokens(body: &[u8], estimation_ratio: f64) -> u64 {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return REQUEST_TOKEN_OVERHEAD;
    };

    let mut chars: u64 = 0;

    if let Some(messages) = value.get("messages").and_then(|m| m.as_array()) {
        for message in messages {
            chars += content_chars(message.get("content"));
        }
    }
    chars += content_chars(value.get("system"));

    let tool_count = value
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|tools| tools.len() as u64)
        .unwrap_or(0);

    let ratio = if estimation_ratio > 0.0 {
        estimation_ratio
    } else {
        4.0
    };
    (chars as f64 / ratio).ceil() as u64 + tool_count * TOOL_TOKEN_COST + REQUEST_TOKEN_OVERHEAD
}

/// Characters in a content value: plain string, or array of blocks with
/// `text` fields.
fn content_chars(content: Option<&serde_json::Value>) -> u64 {
    match content {
        Some(serde_json::Value::String(text)) => text.chars().count() as u64,
        Some(serde_json::Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
            .map(|text| text.chars().count() as u64)
            .sum(),
        _ => 0,
    }
}

/// Copy client headers minus host, client auth and hop-by-hop headers.
fn filter_forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        let name_str = name.as_str();
        if name_str == "host" || name_str == "authorization" || name_str == "x-api-key" {
            continue;
        }
        if HOP_BY_HOP_HEADERS.contains(&name_str) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn read_error_body(response: Response<Body>) -> Bytes {
    match hyper::body::to_bytes(response.into_body()).await {
        Ok(bytes) if bytes.len() > MAX_ERROR_BODY => bytes.slice(..MAX_ERROR_BODY),
        Ok(bytes) => bytes,
        Err(_) => Bytes::new(),
    }
}

fn spawn_model_hint(tracker: Arc<LifecycleTracker>, body: Bytes) {
    tokio::spawn(async move {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body) {
            if let Some(model) = value.get("model").and_then(|m| m.as_str()) {
                tracker.set_model(model);
            }
        }
    });
}

/// Sleep for `delay`, returning false if cancellation interrupted it.
async fn sleep_unless_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn send_control_frame(sender: &mut hyper::body::Sender, kind: &str, detail: &str) {
    let frame = format!("data: {kind}: {detail}\n\n");
    let _ = sender.send_data(Bytes::from(frame)).await;
}

fn default_code_for(status: RequestStatus) -> u16 {
    match status {
        RequestStatus::Cancelled => 499,
        RequestStatus::AuthError => 401,
        RequestStatus::RateLimited => 429,
        _ => 502,
    }
}

fn error_response(
    code: u16,
    status: RequestStatus,
    reason: &str,
    upstream_body: Option<Bytes>,
) -> Response<Body> {
    let status_code = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY);

    // Surface the upstream's own error body when we have one
    let body = match upstream_body {
        Some(bytes) if !bytes.is_empty() => Body::from(bytes),
        _ => Body::from(
            json!({
                "error": {
                    "type": status.as_str(),
                    "message": reason,
                }
            })
            .to_string(),
        ),
    };

    Response::builder()
        .status(status_code)
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .unwrap_or_else(|_| simple_response(StatusCode::BAD_GATEWAY, "upstream failure"))
}

fn simple_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .unwrap_or_default()
}
