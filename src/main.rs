use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use measured_launch::config::{self, BIND_ADDRESS, BIND_PORT};
use measured_launch::engine::PodmanEngine;
use measured_launch::{measurement, routes, shutdown, AppState};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast on a bad configuration before touching the provisioning directory
    let service_config = config::service_config_from_env()?;
    let backend = measurement::backend_from_config(&service_config);
    let engine = Arc::new(PodmanEngine::from_config(&service_config));
    let state = AppState::initialize(&service_config, backend, engine)
        .await
        .with_context(|| {
            format!(
                "failed to prepare provisioning directory {}",
                service_config.provision_dir.display()
            )
        })?;

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = routes::app(state.clone())
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", BIND_ADDRESS.as_str(), *BIND_PORT)
        .parse()
        .context("invalid BIND_ADDRESS/BIND_PORT")?;
    let (watcher, closed) = shutdown::spawn_watcher(state.shutdown.clone());

    tracing::info!(%addr, "Listening for incoming connections");
    let served = axum::Server::try_bind(&addr)
        .with_context(|| format!("failed to bind {addr}"))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(closed)
        .await;
    if let Err(error) = served {
        watcher.abort();
        return Err(error).context("server error");
    }

    watcher.await.context("shutdown watcher failed")?;
    tracing::info!("Server shutdown complete");
    Ok(())
}
