use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyper::body::{Bytes, HttpBody};
use hyper::Body;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{is_network_fingerprint, RelayError};
use crate::tokens::{TokenParser, TokenUsage};

/// Upstream bytes are relayed in slices of at most this size; each slice is
/// written and flushed to the client before the next read.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Sliding window of raw stream bytes kept for post-failure salvage
pub const MAX_PARTIAL_DATA: usize = 64 * 1024;

/// Bound on waiting for the parse task after cancellation
pub const PARSE_SHUTDOWN_WAIT: Duration = Duration::from_secs(2);

/// What a stream forwarding pass produced.
#[derive(Debug)]
pub struct StreamOutcome {
    /// Best known usage; zeroed when nothing was seen
    pub tokens: TokenUsage,
    /// Whether any usage (final or partial) was actually observed
    pub has_usage: bool,
    pub model: Option<String>,
    /// API-level `error` event observed on the stream
    pub api_error: Option<(String, String)>,
    /// Bytes already delivered to the client
    pub bytes_sent: u64,
    pub error: Option<RelayError>,
}

impl StreamOutcome {
    /// A failed pass may be replayed only when nothing reached the client
    /// and the failure smells like a transport problem. Once a byte is out,
    /// a replay would duplicate content.
    pub fn replay_safe(&self) -> bool {
        match &self.error {
            None => false,
            Some(RelayError::ClientDisconnected) => false,
            Some(error) => self.bytes_sent == 0 && is_network_fingerprint(&error.to_string()),
        }
    }
}

/// Chunked SSE forwarder: reads the upstream in bounded chunks, relays each
/// to the client immediately, and feeds a parse task that extracts token
/// usage concurrently. One reader task per stream; the parser sits behind a
/// mutex shared with the salvage path.
pub struct StreamPipeline {
    parser: Arc<Mutex<TokenParser>>,
    partial_window: Mutex<VecDeque<u8>>,
}

impl StreamPipeline {
    pub fn new() -> Self {
        Self {
            parser: Arc::new(Mutex::new(TokenParser::new())),
            partial_window: Mutex::new(VecDeque::with_capacity(MAX_PARTIAL_DATA / 8)),
        }
    }

    /// Forward `upstream` into `client` until EOF, upstream failure, client
    /// write failure or cancellation. Always returns an outcome; the token
    /// fields carry whatever usage could be extracted on the way out.
    pub async fn run(
        &self,
        mut upstream: Body,
        client: &mut hyper::body::Sender,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let (parse_tx, mut parse_rx) = mpsc::unbounded_channel::<Bytes>();
        let parser = self.parser.clone();
        let parse_task = tokio::spawn(async move {
            while let Some(chunk) = parse_rx.recv().await {
                let mut guard = parser.lock().unwrap_or_else(|e| e.into_inner());
                guard.feed(&chunk);
            }
        });

        let mut bytes_sent: u64 = 0;
        let mut error: Option<RelayError> = None;

        'relay: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    error = Some(RelayError::ClientDisconnected);
                    break 'relay;
                }
                read = upstream.data() => {
                    let chunk = match read {
                        None => break 'relay,
                        Some(Err(e)) => {
                            error = Some(RelayError::from(e));
                            break 'relay;
                        }
                        Some(Ok(chunk)) => chunk,
                    };

                    for slice in chunk.chunks(CHUNK_SIZE) {
                        let piece = Bytes::copy_from_slice(slice);
                        // Client write happens before parsing so relay
                        // latency never waits on token extraction
                        if client.send_data(piece.clone()).await.is_err() {
                            error = Some(RelayError::ClientDisconnected);
                            break 'relay;
                        }
                        bytes_sent += piece.len() as u64;
                        self.retain_partial(&piece);
                        let _ = parse_tx.send(piece);
                    }
                }
            }
        }

        // Close the feed and let in-flight parsing drain. Cancellation gets
        // a bounded grace period; EOF and upstream errors wait fully.
        drop(parse_tx);
        let cancelled = matches!(error, Some(RelayError::ClientDisconnected));
        if cancelled {
            if tokio::time::timeout(PARSE_SHUTDOWN_WAIT, parse_task)
                .await
                .is_err()
            {
                debug!("Parse task did not drain within the shutdown grace period");
            }
        } else {
            let _ = parse_task.await;
        }

        let (mut usage, mut model, api_error) = {
            let mut parser = self.parser.lock().unwrap_or_else(|e| e.into_inner());
            parser.flush_pending_event();
            (
                parser.final_usage(),
                parser.model().map(str::to_string),
                parser.api_error().cloned(),
            )
        };

        // Last resort on a broken stream: re-parse the retained tail
        if usage.is_none() && error.is_some() {
            if let Some((salvaged, salvaged_model)) = self.salvage_from_window() {
                debug!("Salvaged usage from {} retained stream bytes", self.window_len());
                usage = Some(salvaged);
                model = model.or(salvaged_model);
            }
        }

        StreamOutcome {
            tokens: usage.unwrap_or_default(),
            has_usage: usage.is_some(),
            model,
            api_error,
            bytes_sent,
            error,
        }
    }

    fn retain_partial(&self, chunk: &[u8]) {
        let mut window = self
            .partial_window
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        window.extend(chunk.iter().copied());
        let excess = window.len().saturating_sub(MAX_PARTIAL_DATA);
        if excess > 0 {
            window.drain(..excess);
        }
    }

    fn window_len(&self) -> usize {
        self.partial_window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn salvage_from_window(&self) -> Option<(TokenUsage, Option<String>)> {
        let data: Vec<u8> = {
            let window = self
                .partial_window
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if window.is_empty() {
                return None;
            }
            window.iter().copied().collect()
        };

        let mut parser = TokenParser::new();
        parser.feed(&data);
        parser.flush_pending_event();
        parser
            .final_usage()
            .map(|usage| (usage, parser.model().map(str::to_string)))
    }
}

impl Default for StreamPipeline {
    fn default() -> Self {
        Self::new()
    }
}
