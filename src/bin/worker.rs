use alpr_alerts::{
    app_state::AppState,
    config::AppConfig,
    db, routes,
    services::dispatcher::{Dispatcher, WakeStrategy},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting plate-hit alert worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let metrics_addr: SocketAddr = config
        .metrics_addr
        .parse()
        .expect("METRICS_ADDR must be a socket address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    routes::metrics::describe_metrics();

    let state = AppState::from_config(&config)
        .await
        .expect("Failed to initialize worker state");

    db::run_migrations(&state.db)
        .await
        .expect("Failed to run database migrations");

    let strategy = WakeStrategy::from_kind(config.wake_strategy_kind(), state.jobs.clone());
    let dispatcher = Dispatcher::new(
        state.dispatch_context(),
        config.dispatch_settings(),
        strategy,
    );

    let cancel = CancellationToken::new();
    let mut dispatch = tokio::spawn(dispatcher.run(cancel.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping dispatcher");
            cancel.cancel();
            match dispatch.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Dispatcher failed during shutdown"),
                Err(e) => tracing::error!(error = %e, "Dispatcher task panicked"),
            }
        }
        finished = &mut dispatch => {
            // Restarting after a fatal dispatcher error is left to the supervisor.
            match finished {
                Ok(Ok(())) => tracing::warn!("Dispatcher exited"),
                Ok(Err(e)) => tracing::error!(error = %e, "Dispatcher exited on fatal error"),
                Err(e) => tracing::error!(error = %e, "Dispatcher task panicked"),
            }
            state.shutdown().await;
            std::process::exit(1);
        }
    }

    state.shutdown().await;
}
