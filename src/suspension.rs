use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SuspendConfig;
use crate::endpoints::EndpointManager;
use crate::logging::{log_request_resumed, log_request_suspended};
use crate::recovery::{RecoveryBus, RecoverySubscription};

/// How a suspended request was released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspensionResult {
    /// The failed endpoint recovered, or a group switch exposed healthy
    /// endpoints
    Success,
    /// The suspension window elapsed
    Timeout,
    /// The client went away while parked
    Cancelled,
}

/// Parks requests whose active endpoints are all failing until the endpoint
/// recovers, a backup group is activated, the window times out, or the
/// client cancels. The suspended counter is bounded and balanced on every
/// exit path.
#[derive(Debug)]
pub struct SuspensionManager {
    config: SuspendConfig,
    endpoints: Arc<EndpointManager>,
    recovery: Arc<RecoveryBus>,
    suspended: AtomicUsize,
}

/// Decrements the suspended counter on drop, so every exit path balances.
struct SuspendGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> SuspendGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

impl SuspensionManager {
    pub fn new(
        config: SuspendConfig,
        endpoints: Arc<EndpointManager>,
        recovery: Arc<RecoveryBus>,
    ) -> Self {
        Self {
            config,
            endpoints,
            recovery,
            suspended: AtomicUsize::new(0),
        }
    }

    pub fn suspended_count(&self) -> usize {
        self.suspended.load(Ordering::Relaxed)
    }

    /// Whether a failing request should be parked instead of failed: the
    /// feature is on, group auto-switching is off (switching would resolve
    /// the outage itself), the parking lot has room, and some standby group
    /// could plausibly take over.
    pub fn should_suspend(&self) -> bool {
        self.config.enabled
            && !self.endpoints.get_group_manager().auto_switch_enabled()
            && self.suspended.load(Ordering::Relaxed) < self.config.max_suspended_requests
            && self.endpoints.has_standby_capacity()
    }

    /// Block until the failed endpoint recovers, a group change exposes
    /// healthy endpoints, the window elapses, or the client cancels.
    pub async fn wait_for_endpoint_recovery(
        &self,
        cancel: &CancellationToken,
        request_id: &str,
        failed_endpoint: &str,
    ) -> SuspensionResult {
        let _guard = SuspendGuard::enter(&self.suspended);
        log_request_suspended(request_id, failed_endpoint, self.suspended_count());

        let mut bus_subscription = if failed_endpoint.is_empty() {
            None
        } else {
            Some(self.recovery.subscribe(failed_endpoint))
        };

        let groups = self.endpoints.get_group_manager();
        let mut group_changes = groups.subscribe_to_group_changes();
        let mut group_channel_open = true;

        let deadline = tokio::time::Instant::now() + self.config.effective_timeout();

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break SuspensionResult::Cancelled,

                _ = tokio::time::sleep_until(deadline) => break SuspensionResult::Timeout,

                recovered = recv_recovery(&mut bus_subscription) => {
                    match recovered {
                        Some(endpoint) => {
                            log_request_resumed(request_id, &format!("endpoint {endpoint} recovered"));
                            break SuspensionResult::Success;
                        }
                        // Closed without a notification; stop polling this arm
                        None => bus_subscription = None,
                    }
                }

                change = group_changes.recv(), if group_channel_open => {
                    use tokio::sync::broadcast::error::RecvError;
                    match change {
                        Ok(_) | Err(RecvError::Lagged(_)) => {
                            if !self.endpoints.get_healthy_endpoints().is_empty() {
                                log_request_resumed(request_id, "group switch exposed healthy endpoints");
                                break SuspensionResult::Success;
                            }
                            // A group changed but nothing healthy is visible
                            // yet; keep waiting
                            debug!("[{request_id}] Group change without healthy endpoints, still suspended");
                        }
                        Err(RecvError::Closed) => group_channel_open = false,
                    }
                }
            }
        };

        if let Some(subscription) = bus_subscription {
            self.recovery.unsubscribe(subscription);
        }

        debug!("[{request_id}] Suspension ended: {result:?}");
        result
    }
}

async fn recv_recovery(subscription: &mut Option<RecoverySubscription>) -> Option<String> {
    match subscription {
        Some(active) => active.recv().await,
        None => std::future::pending().await,
    }
}
