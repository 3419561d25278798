use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::mpsc;
use tracing::debug;

/// A one-shot subscription to recovery notifications for one endpoint.
///
/// Dropping (or passing back to [`RecoveryBus::unsubscribe`]) closes the
/// channel; a subscriber observes at most one notification.
#[derive(Debug)]
pub struct RecoverySubscription {
    id: u64,
    endpoint: String,
    receiver: mpsc::Receiver<String>,
}

impl RecoverySubscription {
    /// Wait for the endpoint-recovered notification. Returns `None` when the
    /// bus broadcast to this endpoint already happened on a full buffer or
    /// the bus dropped the sender.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

/// Broadcast hub announcing "endpoint succeeded" to suspended waiters.
///
/// Subscribers register a capacity-1 channel keyed by endpoint name. A
/// broadcast detaches every subscriber for that endpoint, so each channel
/// receives at most one notification and the map never accumulates stale
/// entries.
#[derive(Debug, Default)]
pub struct RecoveryBus {
    subscribers: RwLock<HashMap<String, Vec<(u64, mpsc::Sender<String>)>>>,
    next_id: AtomicU64,
}

impl RecoveryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, endpoint: &str) -> RecoverySubscription {
        let (sender, receiver) = mpsc::channel(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut map = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        map.entry(endpoint.to_string())
            .or_default()
            .push((id, sender));

        RecoverySubscription {
            id,
            endpoint: endpoint.to_string(),
            receiver,
        }
    }

    /// Notify every subscriber for `endpoint` and detach them. The send is
    /// non-blocking; a full buffer means the subscriber was already notified
    /// and the duplicate is dropped. Returns how many notifications landed.
    pub fn broadcast(&self, endpoint: &str) -> usize {
        let detached = {
            let mut map = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
            map.remove(endpoint)
        };

        let Some(subscribers) = detached else {
            return 0;
        };

        let mut notified = 0;
        for (_, sender) in subscribers {
            if sender.try_send(endpoint.to_string()).is_ok() {
                notified += 1;
            }
        }
        if notified > 0 {
            debug!("Recovery broadcast for {endpoint} reached {notified} waiters");
        }
        notified
    }

    /// Remove the subscription if it is still registered and close it.
    pub fn unsubscribe(&self, subscription: RecoverySubscription) {
        let mut map = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entries) = map.get_mut(&subscription.endpoint) {
            entries.retain(|(id, _)| *id != subscription.id);
            if entries.is_empty() {
                map.remove(&subscription.endpoint);
            }
        }
        // The receiver half drops here, closing the channel exactly once
    }

    pub fn subscriber_count(&self, endpoint: &str) -> usize {
        let map = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        map.get(endpoint).map(Vec::len).unwrap_or(0)
    }

    pub fn total_subscriber_count(&self) -> usize {
        let map = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        map.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers_once() {
        let bus = Arc::new(RecoveryBus::new());
        let mut subscriptions: Vec<RecoverySubscription> =
            (0..8).map(|_| bus.subscribe("ep-a")).collect();
        assert_eq!(bus.subscriber_count("ep-a"), 8);

        let notified = bus.broadcast("ep-a");
        assert_eq!(notified, 8);
        assert_eq!(bus.subscriber_count("ep-a"), 0);
        assert_eq!(bus.total_subscriber_count(), 0);

        for subscription in &mut subscriptions {
            assert_eq!(subscription.recv().await.as_deref(), Some("ep-a"));
        }
    }

    #[tokio::test]
    async fn test_broadcast_is_scoped_to_endpoint() {
        let bus = RecoveryBus::new();
        let _a = bus.subscribe("ep-a");
        let _b = bus.subscribe("ep-b");

        assert_eq!(bus.broadcast("ep-a"), 1);
        assert_eq!(bus.subscriber_count("ep-a"), 0);
        assert_eq!(bus.subscriber_count("ep-b"), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_and_closes() {
        let bus = RecoveryBus::new();
        let subscription = bus.subscribe("ep-a");
        assert_eq!(bus.subscriber_count("ep-a"), 1);

        bus.unsubscribe(subscription);
        assert_eq!(bus.subscriber_count("ep-a"), 0);
        assert_eq!(bus.broadcast("ep-a"), 0);
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_noop() {
        let bus = RecoveryBus::new();
        assert_eq!(bus.broadcast("nobody-home"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_and_broadcast() {
        let bus = Arc::new(RecoveryBus::new());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                let mut subscription = bus.subscribe("ep-a");
                subscription.recv().await
            }));
        }

        // Keep broadcasting until every waiter has been detached
        loop {
            bus.broadcast("ep-a");
            if bus.subscriber_count("ep-a") == 0
                && handles.iter().all(|handle| handle.is_finished())
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().as_deref(), Some("ep-a"));
        }
    }
}
