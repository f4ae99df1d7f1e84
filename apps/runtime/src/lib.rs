#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    config::Config,
    db::RuntimeDb,
    delivery::DeliveryService,
    server::{AppState, build_router},
};

pub mod catalog;
pub mod config;
pub mod db;
pub mod delivery;
pub mod frequency;
pub mod funding;
pub mod ledger;
pub mod payments;
pub mod selector;
pub mod server;

/// Postgres-backed stores when a database URL is configured, memory stores otherwise.
pub async fn build_delivery_service(config: &Config) -> Result<DeliveryService> {
    let (catalog, ledger, frequency) = match config.db_url.as_deref() {
        Some(url) => {
            let db = Arc::new(RuntimeDb::connect(url).await?);
            db.migrate().await?;
            (
                catalog::store::postgres(db.clone()),
                ledger::store::postgres(db.clone()),
                frequency::postgres(db),
            )
        }
        None => {
            info!("no database configured; using in-memory stores");
            (
                catalog::store::memory(),
                ledger::store::memory(),
                frequency::memory(),
            )
        }
    };
    Ok(DeliveryService::new(
        catalog,
        ledger,
        frequency,
        config.platform_fee_bps,
        config.cpc_estimated_ctr_bps,
    ))
}

pub async fn build_runtime_state(config: Config) -> Result<AppState> {
    let delivery = build_delivery_service(&config).await?;
    Ok(AppState::new(config, delivery))
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_runtime_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let state = build_runtime_state(config.clone()).await?;
    if config.funding_sweep_enabled {
        funding::spawn_sweep_worker(
            state.delivery().monitor().clone(),
            state.delivery().frequency(),
            Duration::from_secs(config.funding_sweep_interval_seconds),
        );
        info!(
            interval_seconds = config.funding_sweep_interval_seconds,
            "funding sweep worker started"
        );
    }
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        "admarket runtime listening"
    );
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
