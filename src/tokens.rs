use serde::{Deserialize, Serialize};
use tracing::warn;

/// Initial capacity of the SSE line buffer
pub const LINE_BUFFER_INITIAL: usize = 1024;

/// Token usage accumulated from Anthropic-style usage blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_creation_input_tokens: i64,
    #[serde(default)]
    pub cache_read_input_tokens: i64,
}

impl TokenUsage {
    pub fn has_any(&self) -> bool {
        self.input_tokens != 0
            || self.output_tokens != 0
            || self.cache_creation_input_tokens != 0
            || self.cache_read_input_tokens != 0
    }
}

/// What a completed SSE event yielded.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// Final usage from a `message_delta`
    Tokens { usage: TokenUsage, model: String },
    /// The message completed without a usage block
    NonTokenComplete { model: String },
    /// An API-level `error` event
    ApiError { error_type: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseResult {
    pub outcome: ParseOutcome,
    pub completed: bool,
    pub status: &'static str,
}

impl ParseResult {
    fn tokens(usage: TokenUsage, model: String) -> Self {
        Self {
            outcome: ParseOutcome::Tokens { usage, model },
            completed: true,
            status: "completed",
        }
    }

    fn non_token(model: String) -> Self {
        Self {
            outcome: ParseOutcome::NonTokenComplete { model },
            completed: true,
            status: "non_token_response",
        }
    }

    fn api_error(error_type: String, message: String) -> Self {
        Self {
            outcome: ParseOutcome::ApiError {
                error_type,
                message,
            },
            completed: false,
            status: "error_api",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    cache_creation_input_tokens: i64,
    #[serde(default)]
    cache_read_input_tokens: i64,
}

impl From<WireUsage> for TokenUsage {
    fn from(wire: WireUsage) -> Self {
        TokenUsage {
            input_tokens: wire.input_tokens,
            output_tokens: wire.output_tokens,
            cache_creation_input_tokens: wire.cache_creation_input_tokens,
            cache_read_input_tokens: wire.cache_read_input_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageStartEvent {
    message: Option<MessageStartBody>,
}

#[derive(Debug, Deserialize)]
struct MessageStartBody {
    model: Option<String>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaEvent {
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEvent {
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "type")]
    error_type: Option<String>,
    message: Option<String>,
}

/// Incremental SSE parser for Anthropic message streams.
///
/// Feed raw chunks as they arrive; completed events yield [`ParseResult`]s.
/// Lines beginning with `event:` set the current event type, `data:` lines
/// accumulate the payload, and a blank line terminates the event. A stream
/// cut before the final blank line can be salvaged with
/// [`TokenParser::flush_pending_event`].
#[derive(Debug)]
pub struct TokenParser {
    line_buffer: String,
    event_type: String,
    data_buffer: String,
    model: Option<String>,
    partial: Option<TokenUsage>,
    final_usage: Option<TokenUsage>,
    api_error: Option<(String, String)>,
}

impl TokenParser {
    pub fn new() -> Self {
        Self {
            line_buffer: String::with_capacity(LINE_BUFFER_INITIAL),
            event_type: String::new(),
            data_buffer: String::new(),
            model: None,
            partial: None,
            final_usage: None,
            api_error: None,
        }
    }

    /// Feed a raw chunk; returns results for every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ParseResult> {
        let text = String::from_utf8_lossy(chunk);
        self.line_buffer.push_str(&text);

        let mut results = Vec::new();
        while let Some(pos) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(result) = self.handle_line(line) {
                results.push(result);
            }
        }
        results
    }

    fn handle_line(&mut self, line: &str) -> Option<ParseResult> {
        if line.is_empty() {
            return self.finish_event();
        }

        if let Some(raw_name) = line.strip_prefix("event:") {
            self.event_type = parse_event_name(raw_name);
            return None;
        }

        if let Some(payload) = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))
        {
            if !self.data_buffer.is_empty() {
                self.data_buffer.push('\n');
            }
            self.data_buffer.push_str(payload);
        }
        // Comment lines (":") and unknown fields are ignored per SSE framing

        None
    }

    /// Parse whatever is buffered as if the terminating blank line arrived.
    /// Used when the upstream closes without a final newline so the last
    /// `message_delta` is not lost.
    pub fn flush_pending_event(&mut self) -> Option<ParseResult> {
        if !self.line_buffer.is_empty() {
            let trailing: String = self.line_buffer.drain(..).collect();
            for line in trailing.lines() {
                let line = line.trim_end_matches('\r');
                if !line.is_empty() {
                    self.handle_line(line);
                }
            }
        }
        self.finish_event()
    }

    fn finish_event(&mut self) -> Option<ParseResult> {
        if self.event_type.is_empty() && self.data_buffer.is_empty() {
            return None;
        }

        let event_type = std::mem::take(&mut self.event_type);
        let data = std::mem::take(&mut self.data_buffer);

        match event_type.as_str() {
            "message_start" => {
                self.handle_message_start(&data);
                None
            }
            "message_delta" => self.handle_message_delta(&data),
            "error" => self.handle_api_error(&data),
            // ping, message_stop, content_block_* carry no usage
            _ => None,
        }
    }

    fn handle_message_start(&mut self, data: &str) {
        let Ok(event) = serde_json::from_str::<MessageStartEvent>(data) else {
            warn!("Unparseable message_start payload");
            return;
        };
        let Some(body) = event.message else {
            return;
        };
        if let Some(model) = body.model {
            self.model = Some(model);
        }
        // Usage at message_start is partial (output count is typically 0);
        // keep it only as a truncation fallback, never emit it as final
        if let Some(usage) = body.usage {
            self.partial = Some(usage.into());
        }
    }

    fn handle_message_delta(&mut self, data: &str) -> Option<ParseResult> {
        let Ok(event) = serde_json::from_str::<MessageDeltaEvent>(data) else {
            warn!("Unparseable message_delta payload");
            return None;
        };
        match event.usage {
            Some(usage) => {
                let usage: TokenUsage = usage.into();
                self.final_usage = Some(usage);
                Some(ParseResult::tokens(usage, self.model_or_default()))
            }
            None => Some(ParseResult::non_token(self.model_or_default())),
        }
    }

    fn handle_api_error(&mut self, data: &str) -> Option<ParseResult> {
        let body = serde_json::from_str::<ApiErrorEvent>(data)
            .ok()
            .and_then(|event| event.error);
        let error_type = body
            .as_ref()
            .and_then(|b| b.error_type.clone())
            .unwrap_or_else(|| "unknown".to_string());
        let message = body
            .and_then(|b| b.message)
            .unwrap_or_else(|| "unknown API error".to_string());
        self.api_error = Some((error_type.clone(), message.clone()));
        Some(ParseResult::api_error(error_type, message))
    }

    fn model_or_default(&self) -> String {
        self.model.clone().unwrap_or_else(|| "default".to_string())
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Usage seen at `message_start`, if any. Output counts are unreliable.
    pub fn partial_usage(&self) -> Option<TokenUsage> {
        self.partial
    }

    /// Best known usage: the `message_delta` value, or the `message_start`
    /// partial when the stream was cut before the delta arrived.
    pub fn final_usage(&self) -> Option<TokenUsage> {
        self.final_usage.or(self.partial)
    }

    /// API-level error event seen on the stream, if any
    pub fn api_error(&self) -> Option<&(String, String)> {
        self.api_error.as_ref()
    }
}

impl Default for TokenParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the event name, tolerating malformed headers like
/// `event: content_event: message_delta` by taking the last non-empty
/// colon-delimited segment.
fn parse_event_name(raw: &str) -> String {
    let segments: Vec<&str> = raw
        .split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if segments.len() > 1 {
        warn!("Malformed SSE event header '{}'", raw.trim());
    }
    segments.last().copied().unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELTA_USAGE: &str = concat!(
        "event: message_delta\n",
        "data: {\"usage\":{\"input_tokens\":10,\"output_tokens\":20,",
        "\"cache_creation_input_tokens\":0,\"cache_read_input_tokens\":0}}\n",
        "\n"
    );

    fn start_event(model: &str) -> String {
        format!(
            "event: message_start\ndata: {{\"message\":{{\"model\":\"{model}\",\
             \"usage\":{{\"input_tokens\":5000,\"output_tokens\":0,\
             \"cache_read_input_tokens\":200}}}}}}\n\n"
        )
    }

    #[test]
    fn test_message_start_sets_model_without_emitting_tokens() {
        let mut parser = TokenParser::new();
        let results = parser.feed(start_event("claude-3-5-sonnet-20241022").as_bytes());
        assert!(results.is_empty());
        assert_eq!(parser.model(), Some("claude-3-5-sonnet-20241022"));
        assert_eq!(parser.partial_usage().unwrap().input_tokens, 5000);
    }

    #[test]
    fn test_message_delta_produces_final_tokens() {
        let mut parser = TokenParser::new();
        parser.feed(start_event("claude-3-5-haiku-20241022").as_bytes());
        let results = parser.feed(DELTA_USAGE.as_bytes());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, "completed");
        assert!(results[0].completed);
        match &results[0].outcome {
            ParseOutcome::Tokens { usage, model } => {
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.output_tokens, 20);
                assert_eq!(model, "claude-3-5-haiku-20241022");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_final_usage_falls_back_to_partial_on_truncation() {
        let mut parser = TokenParser::new();
        parser.feed(start_event("claude-3-5-sonnet-20241022").as_bytes());
        // Stream cut before any message_delta
        let usage = parser.final_usage().unwrap();
        assert_eq!(usage.input_tokens, 5000);
        assert_eq!(usage.output_tokens, 0);
        assert_eq!(usage.cache_read_input_tokens, 200);
    }

    #[test]
    fn test_final_usage_prefers_delta_over_partial() {
        let mut parser = TokenParser::new();
        parser.feed(start_event("claude-3-5-sonnet-20241022").as_bytes());
        parser.feed(DELTA_USAGE.as_bytes());
        let usage = parser.final_usage().unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 20);
    }

    #[test]
    fn test_malformed_event_header_takes_last_segment() {
        let mut parser = TokenParser::new();
        let chunk = concat!(
            "event: content_event: message_delta\n",
            "data: {\"usage\":{\"input_tokens\":10,\"output_tokens\":20,",
            "\"cache_creation_input_tokens\":0,\"cache_read_input_tokens\":0}}\n",
            "\n"
        );
        let results = parser.feed(chunk.as_bytes());
        assert_eq!(results.len(), 1);
        match &results[0].outcome {
            ParseOutcome::Tokens { usage, .. } => {
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.output_tokens, 20);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_message_delta_without_usage_is_non_token() {
        let mut parser = TokenParser::new();
        let results = parser.feed(b"event: message_delta\ndata: {\"delta\":{}}\n\n");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, "non_token_response");
        assert_eq!(
            results[0].outcome,
            ParseOutcome::NonTokenComplete {
                model: "default".to_string()
            }
        );
    }

    #[test]
    fn test_error_event() {
        let mut parser = TokenParser::new();
        let chunk = concat!(
            "event: error\n",
            "data: {\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n",
            "\n"
        );
        let results = parser.feed(chunk.as_bytes());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, "error_api");
        match &results[0].outcome {
            ParseOutcome::ApiError {
                error_type,
                message,
            } => {
                assert_eq!(error_type, "overloaded_error");
                assert_eq!(message, "Overloaded");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(parser.api_error().is_some());
    }

    #[test]
    fn test_ping_and_message_stop_produce_nothing() {
        let mut parser = TokenParser::new();
        let results = parser.feed(b"event: ping\ndata: {}\n\nevent: message_stop\ndata: {}\n\n");
        assert!(results.is_empty());
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut parser = TokenParser::new();
        assert!(parser.feed(b"event: message_del").is_empty());
        assert!(parser
            .feed(b"ta\ndata: {\"usage\":{\"input_tokens\":3,\"output_tokens\":4}}")
            .is_empty());
        let results = parser.feed(b"\n\n");
        assert_eq!(results.len(), 1);
        match &results[0].outcome {
            ParseOutcome::Tokens { usage, .. } => {
                assert_eq!(usage.input_tokens, 3);
                assert_eq!(usage.output_tokens, 4);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_flush_pending_event_recovers_unterminated_delta() {
        let mut parser = TokenParser::new();
        // No trailing blank line, no trailing newline
        parser.feed(b"event: message_delta\ndata: {\"usage\":{\"input_tokens\":7,\"output_tokens\":9}}");
        let result = parser.flush_pending_event().unwrap();
        match result.outcome {
            ParseOutcome::Tokens { usage, .. } => {
                assert_eq!(usage.input_tokens, 7);
                assert_eq!(usage.output_tokens, 9);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_data_prefix_without_space() {
        let mut parser = TokenParser::new();
        let results =
            parser.feed(b"event:message_delta\ndata:{\"usage\":{\"input_tokens\":1}}\n\n");
        assert_eq!(results.len(), 1);
    }
}
