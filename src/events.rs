use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::EventsConfig;
use crate::logging::log_event_dropped;

/// Lifecycle record types accepted by the persistence layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventType {
    Start,
    FlexibleUpdate,
    Success,
    FinalFailure,
    FailedRequestTokens,
    TokenRecovery,
    Flush,
}

/// One lifecycle record destined for the event sink
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub event_type: LifecycleEventType,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl LifecycleEvent {
    pub fn new(
        event_type: LifecycleEventType,
        request_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            request_id: request_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Non-blocking producer half of the lifecycle event queue.
///
/// The queue is bounded; when full, events are dropped with a warning rather
/// than stalling request handling.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::Sender<LifecycleEvent>,
    dropped: std::sync::Arc<AtomicU64>,
}

impl EventSink {
    /// Build the sink and its drain worker. Spawn the worker with
    /// `tokio::spawn(worker.run())`.
    pub fn new(config: &EventsConfig) -> (Self, EventSinkWorker) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let sink = Self {
            sender,
            dropped: std::sync::Arc::new(AtomicU64::new(0)),
        };
        let worker = EventSinkWorker {
            receiver,
            output_file: config.output_file.clone().map(PathBuf::from),
        };
        (sink, worker)
    }

    pub fn send(&self, event: LifecycleEvent) {
        if self.sender.try_send(event).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            log_event_dropped(dropped);
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drains the lifecycle queue, appending JSON lines to the configured file
/// or logging at debug level when no file is set.
pub struct EventSinkWorker {
    receiver: mpsc::Receiver<LifecycleEvent>,
    output_file: Option<PathBuf>,
}

impl EventSinkWorker {
    /// Receive the next queued event. Exposed for the run loop and tests.
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking receive for introspection in tests
    pub fn try_recv(&mut self) -> Option<LifecycleEvent> {
        self.receiver.try_recv().ok()
    }

    pub async fn run(mut self) {
        let mut writer = match &self.output_file {
            Some(path) => match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
            {
                Ok(file) => Some(file),
                Err(e) => {
                    error!("Cannot open event sink file {}: {e}", path.display());
                    None
                }
            },
            None => None,
        };

        while let Some(event) = self.recv().await {
            let line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(e) => {
                    error!("Unserializable lifecycle event: {e}");
                    continue;
                }
            };

            match &mut writer {
                Some(file) => {
                    if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
                        error!("Event sink write failed: {e}");
                    }
                }
                None => debug!(target: "lifecycle", "{line}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(capacity: usize) -> EventsConfig {
        EventsConfig {
            queue_capacity: capacity,
            output_file: None,
        }
    }

    fn event(id: &str) -> LifecycleEvent {
        LifecycleEvent::new(
            LifecycleEventType::Start,
            id,
            serde_json::json!({"path": "/v1/messages"}),
        )
    }

    #[tokio::test]
    async fn test_events_flow_through_queue() {
        let (sink, mut worker) = EventSink::new(&config(8));
        sink.send(event("req-1"));
        sink.send(event("req-2"));

        let first = worker.receiver.recv().await.unwrap();
        assert_eq!(first.request_id, "req-1");
        assert_eq!(first.event_type, LifecycleEventType::Start);
        let second = worker.receiver.recv().await.unwrap();
        assert_eq!(second.request_id, "req-2");
        assert_eq!(sink.dropped_count(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (sink, _worker) = EventSink::new(&config(2));
        for i in 0..5 {
            sink.send(event(&format!("req-{i}")));
        }
        // Capacity 2: three of five must have been dropped, and send never
        // blocked the caller
        assert_eq!(sink.dropped_count(), 3);
    }

    #[test]
    fn test_event_type_serializes_snake_case() {
        let json = serde_json::to_string(&LifecycleEventType::FailedRequestTokens).unwrap();
        assert_eq!(json, "\"failed_request_tokens\"");
    }
}
