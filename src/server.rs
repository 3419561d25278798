use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::endpoints::EndpointManager;
use crate::events::EventSink;
use crate::logging::{log_server_error, log_server_start};
use crate::recovery::RecoveryBus;
use crate::suspension::SuspensionManager;

/// Everything the request handler needs, cloned per connection.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    dispatcher: Dispatcher,
    endpoints: Arc<EndpointManager>,
    suspension: Arc<SuspensionManager>,
    recovery: Arc<RecoveryBus>,
    sink: Arc<EventSink>,
}

#[allow(clippy::too_many_arguments)]
pub async fn start_server(
    config: Arc<Config>,
    dispatcher: Dispatcher,
    endpoints: Arc<EndpointManager>,
    suspension: Arc<SuspensionManager>,
    recovery: Arc<RecoveryBus>,
    sink: Arc<EventSink>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {e}"))?;

    let state = AppState {
        config: config.clone(),
        dispatcher,
        endpoints,
        suspension,
        recovery,
        sink,
    };

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let state = state.clone();
        let remote_ip = conn.remote_addr().ip().to_string();

        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let state = state.clone();
                let remote_ip = remote_ip.clone();
                async move { Ok::<Response<Body>, hyper::Error>(handle(req, state, remote_ip).await) }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    log_server_start(&config.server.host, config.server.port);

    let graceful = server.with_graceful_shutdown(async move { shutdown.cancelled().await });
    if let Err(e) = graceful.await {
        log_server_error(&format!("{e}"));
        return Err(anyhow::anyhow!("Server error: {}", e));
    }

    Ok(())
}

async fn handle(req: Request<Body>, state: AppState, remote_ip: String) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => Response::builder()
            .status(StatusCode::OK)
            .body(Body::from("OK"))
            .unwrap_or_default(),
        (&Method::GET, "/status") => status_handler(&state),
        _ => state.dispatcher.dispatch(req, remote_ip).await,
    }
}

fn status_handler(state: &AppState) -> Response<Body> {
    let groups = state.endpoints.get_group_manager();

    let endpoint_status: Vec<serde_json::Value> = state
        .endpoints
        .every_endpoint()
        .iter()
        .map(|endpoint| {
            serde_json::json!({
                "name": endpoint.name,
                "group": endpoint.group,
                "url": endpoint.url,
                "healthy": endpoint.is_healthy(),
                "latency_ms": endpoint.latency_ms(),
                "priority": endpoint.priority,
                "supports_count_tokens": endpoint.supports_count_tokens,
            })
        })
        .collect();

    let group_status: Vec<serde_json::Value> = groups
        .get_all_groups()
        .iter()
        .map(|group| {
            serde_json::json!({
                "name": group.name,
                "priority": group.priority,
                "active": group.is_active(),
                "in_cooldown": groups.is_group_in_cooldown(&group.name),
            })
        })
        .collect();

    let status = serde_json::json!({
        "endpoints": endpoint_status,
        "groups": group_status,
        "suspended_requests": state.suspension.suspended_count(),
        "recovery_subscribers": state.recovery.total_subscriber_count(),
        "dropped_lifecycle_events": state.sink.dropped_count(),
        "timestamp": chrono::Utc::now(),
        "config": {
            "port": state.config.server.port,
            "strategy": state.config.strategy.strategy_type,
            "retry_max_attempts": state.config.retry.max_attempts,
            "suspend_enabled": state.config.suspend.enabled,
        }
    });

    let body = serde_json::to_string_pretty(&status).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}
