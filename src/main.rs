mod buffered;
mod config;
mod dispatch;
mod endpoints;
mod error;
mod events;
mod health;
mod lifecycle;
mod logging;
mod pricing;
mod recovery;
mod retry;
mod server;
mod stream;
mod suspension;
mod tokens;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use config::Config;
use dispatch::Dispatcher;
use endpoints::{build_https_client, EndpointManager, GroupManager};
use events::EventSink;
use health::HealthProber;
use logging::log_config_loaded;
use recovery::RecoveryBus;
use suspension::SuspensionManager;

#[derive(Parser)]
#[command(name = "claude-relay")]
#[command(about = "Failure-tolerant relay for Anthropic-style LLM APIs")]
struct Args {
    /// Path to the configuration file
    #[arg(long, short, help = "Configuration file (defaults to config.toml)")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration first so logging honors the configured level
    let config = match &args.config {
        Some(path) => Config::load_from_file(path),
        None => Config::load_default(),
    }
    .map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    init_tracing(&config.logging.level);
    log_config_loaded(config.endpoints.len(), config.group_names().len());

    let config = Arc::new(config);
    let shutdown = CancellationToken::new();

    // Shared infrastructure
    let client = build_https_client();
    let recovery = Arc::new(RecoveryBus::new());
    let groups = Arc::new(GroupManager::new(&config));
    let endpoints = Arc::new(EndpointManager::new(
        &config,
        groups,
        recovery.clone(),
        client.clone(),
    )?);
    let suspension = Arc::new(SuspensionManager::new(
        config.suspend.clone(),
        endpoints.clone(),
        recovery.clone(),
    ));

    // Lifecycle event sink and its drain worker
    let (sink, sink_worker) = EventSink::new(&config.events);
    let sink = Arc::new(sink);
    tokio::spawn(sink_worker.run());

    // Background health probing keeps endpoint state fresh and wakes
    // suspended requests on recovery
    let prober = HealthProber::new(
        config.health_check.clone(),
        endpoints.clone(),
        client.clone(),
    );
    tokio::spawn(prober.run(shutdown.clone()));

    let dispatcher = Dispatcher::new(
        config.clone(),
        client,
        endpoints.clone(),
        suspension.clone(),
        sink.clone(),
    );

    // Ctrl-C drains in-flight requests before exit
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let result = server::start_server(
        config,
        dispatcher,
        endpoints,
        suspension,
        recovery,
        sink.clone(),
        shutdown,
    )
    .await;

    // Ask the sink to flush whatever the drain worker still holds
    sink.send(events::LifecycleEvent::new(
        events::LifecycleEventType::Flush,
        "shutdown",
        serde_json::json!({}),
    ));

    result
}

fn init_tracing(level: &str) {
    let level = match level {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}
