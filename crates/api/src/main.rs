//! API server entry point.

use std::sync::Arc;

use event_store::{
    EventStore, InMemoryEventStore, InMemoryProcessedEvents, PostgresEventStore,
    PostgresProcessedEvents, ProcessedEventLog,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use api::config::{Config, LogFormat};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Restores state, starts background tasks and serves until shutdown.
async fn run<S: EventStore + Clone + 'static>(
    store: S,
    processed: Arc<dyn ProcessedEventLog>,
    config: &Config,
    metrics_handle: PrometheusHandle,
) -> Result<(), BoxError> {
    let state = api::create_state(store, processed, config);
    state.fulfillment.restore().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = state
        .fulfillment
        .sweeper
        .clone()
        .spawn(state.config.sweep_interval, shutdown_rx.clone());
    let pruner = state
        .fulfillment
        .webhooks
        .clone()
        .spawn_pruner(state.config.prune_interval, shutdown_rx);

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(sweeper, pruner);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = Config::from_env();

    // 1. Initialize tracing
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    // 3. Pick the storage backend and serve
    match &config.database_url {
        Some(url) => {
            let store = PostgresEventStore::connect(url, config.database_max_connections).await?;
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL event store");
            let processed = Arc::new(PostgresProcessedEvents::new(store.pool().clone()));
            run(store, processed, &config, metrics_handle).await?;
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory event store");
            let processed = Arc::new(InMemoryProcessedEvents::new());
            run(InMemoryEventStore::new(), processed, &config, metrics_handle).await?;
        }
    }

    tracing::info!("server shut down gracefully");
    Ok(())
}
