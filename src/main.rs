use std::sync::Arc;

use bridge_relayer::api::{self, AppState};
use bridge_relayer::config::{Config, LogFormat};
use bridge_relayer::engine::RelayEngine;
use bridge_relayer::metrics;
use bridge_relayer::rpc::{BridgeChain, EvmBridgeChain};
use bridge_relayer::store::JsonFileStore;
use bridge_relayer::watchers::WatcherManager;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    let config = Config::load()?;
    init_logging(config.log_format);

    tracing::info!("Starting bridge relayer");
    tracing::info!(
        source = %config.source.name,
        destination = %config.destination.name,
        state_file = %config.state.path.display(),
        "Configuration loaded"
    );

    let store = Arc::new(JsonFileStore::open(&config.state.path, config.state.max_records).await?);
    tracing::info!("State file loaded");

    let policy = config.backoff_policy();
    let source: Arc<dyn BridgeChain> = Arc::new(EvmBridgeChain::new(
        &config.source,
        &config.relayer.private_key,
        policy.clone(),
    )?);
    let destination: Arc<dyn BridgeChain> = Arc::new(EvmBridgeChain::new(
        &config.destination,
        &config.relayer.private_key,
        policy,
    )?);

    let engine = Arc::new(RelayEngine::from_config(
        &config,
        source,
        destination,
        store,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let api_addr = config.api.socket_addr()?;
    let api_state = AppState::new(engine.clone());
    let api_shutdown = shutdown_rx.clone();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, api_state, api_shutdown).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    metrics::UP.set(1.0);
    tracing::info!("Relayer initialized, starting watchers");

    let result = WatcherManager::new(&config, engine).run(shutdown_rx).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "Watcher manager error");
    }

    // Watchers only return on shutdown or panic; make sure the API follows
    if let Err(e) = api_task.await {
        tracing::error!(error = %e, "API task failed");
    }

    metrics::UP.set(0.0);
    tracing::info!("Bridge relayer stopped");
    result
}

/// Initialize tracing/logging with structured output
fn init_logging(format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_relayer=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init(),
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
