use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courier::config::Config;
use courier::egress::{ChannelRegistry, EgressRouter};
use courier::publisher::{AllowAll, EventPublisher};
use courier::queue::{BrokerTransport, InMemoryBroker, QueueMode, SuspendedQueue, build_backend};
use courier::server::{AppState, build_app};
use courier::watchdog::WatchdogRegistry;
use courier::worker::{EchoProcessor, ExecutionWorker};

#[derive(Parser)]
#[command(name = "courier", version, about = "Event delivery pipeline for assistant runtimes")]
struct Cli {
    /// Path to the YAML config file.
    #[arg(long, default_value = "courier.yaml")]
    config: PathBuf,

    /// Override the configured queue mode (local or broker).
    #[arg(long)]
    queue_mode: Option<QueueMode>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config).await?;
    if let Some(mode) = cli.queue_mode {
        config.queue.mode = mode;
    }
    info!(mode = %config.queue.mode, queue = %config.queue.queue_name, "starting courier");

    let transport: Arc<dyn BrokerTransport> = Arc::new(InMemoryBroker::new());
    let backend = build_backend(&config.queue, transport.clone());
    let suspended = Arc::new(SuspendedQueue::new(
        transport,
        config.queue.suspended_queue_name.clone(),
        backend.clone(),
        config.queue.consumer.replay_tuning(),
    ));
    let publisher = Arc::new(EventPublisher::new(
        backend.clone(),
        suspended.clone(),
        Arc::new(AllowAll),
    ));

    // Channel senders register here; deployments without gateway crates run
    // headless and the echo processor just logs through egress drops.
    let channels = Arc::new(ChannelRegistry::default());
    let watchdogs = Arc::new(WatchdogRegistry::new(
        channels.clone(),
        config.watchdog.registry_config(),
    ));
    let egress = Arc::new(EgressRouter::new(channels));
    let worker = ExecutionWorker::new(backend, Arc::new(EchoProcessor), egress, watchdogs);
    tokio::spawn(async move { worker.run().await });

    let state = AppState {
        publisher,
        suspended,
    };
    let app = build_app(state, config.server.request_timeout_seconds);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
