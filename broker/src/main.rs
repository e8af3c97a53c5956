mod assembler;
mod broker;
mod catalog;
mod config;
mod error;
mod handlers;
mod job;
mod scaler;
mod state;
mod storage;

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::scaler::{FleetScaler, LoggingLauncher};
use crate::state::AppState;
use crate::storage::LocalFileStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("broker=debug,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // línea única por arranque, para encontrar reinicios en los logs
    info!("broker arrancando a las {}", Utc::now().to_rfc3339());

    let config = BrokerConfig::from_env().context("configuración inválida")?;
    info!(
        "offline={} max_workers={} resultados en {} (bucket {})",
        config.offline,
        config.max_workers,
        config.results_dir.display(),
        config.results_bucket
    );

    let storage = Arc::new(LocalFileStorage::new(config.results_dir.clone()));
    let scaler = FleetScaler::new(
        config.launch.clone(),
        Arc::new(LoggingLauncher),
        config.launch_concurrency,
        Handle::current(),
    );
    let bind_addr = config.bind_addr;
    let state = AppState::new(Broker::new(config, scaler, storage));

    // router HTTP
    let app = handlers::build_router(state);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", bind_addr))?;
    info!("broker escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
