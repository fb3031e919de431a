pub mod address;
pub mod admin;
pub mod alerts;
pub mod balance;
mod env;
mod log;
pub mod monitor;
pub mod oracle;
pub mod serve;
pub mod store;
pub mod sweep;

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use futures::{try_join, TryFutureExt};
use tracing::{info, warn};

use crate::{
    admin::AdminService,
    alerts::TelegramNotifier,
    env::APP_CONFIG,
    monitor::BalanceMonitor,
    oracle::{default_tokens, BalanceOracle, BalanceSource, ExplorerSource, RpcSource},
    serve::AppState,
    store::{JsonFileStorage, SubscriptionStore},
};

fn balance_sources(client: &reqwest::Client) -> Vec<Box<dyn BalanceSource>> {
    let mut sources: Vec<Box<dyn BalanceSource>> = APP_CONFIG
        .rpc_urls
        .iter()
        .map(|url| {
            Box::new(RpcSource::new(client.clone(), url.clone())) as Box<dyn BalanceSource>
        })
        .collect();

    match &APP_CONFIG.explorer_api_key {
        Some(api_key) => sources.push(Box::new(ExplorerSource::new(
            client.clone(),
            APP_CONFIG.explorer_url.clone(),
            api_key.clone(),
            APP_CONFIG.explorer_chain_id,
        ))),
        None => warn!("no EXPLORER_API_KEY configured, explorer fallback disabled"),
    }

    sources
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("received shutdown signal");
}

/// Runs the balance monitor and the admin api until interrupted.
pub async fn run_service() -> Result<()> {
    log::init();

    let client = reqwest::Client::builder()
        .timeout(APP_CONFIG.request_timeout())
        .build()?;

    let oracle = Arc::new(
        BalanceOracle::new(balance_sources(&client))?
            .with_tokens(default_tokens())
            .with_asset_delay(APP_CONFIG.sweep_config().request_delay),
    );
    let store = Arc::new(
        SubscriptionStore::open(JsonFileStorage::new(&APP_CONFIG.data_file))
            .await
            .with_context(|| format!("failed to open {}", APP_CONFIG.data_file.display()))?,
    );
    let notifier = Arc::new(TelegramNotifier::new(
        client.clone(),
        APP_CONFIG.telegram_api_url.clone(),
        APP_CONFIG.telegram_api_key.clone(),
    ));

    let monitor = Arc::new(BalanceMonitor::new(
        oracle.clone(),
        store.clone(),
        notifier,
        APP_CONFIG.monitor_config(),
    ));
    let admin = Arc::new(AdminService::new(monitor.clone(), store));

    let monitor_thread = monitor.start().await;

    let addr = SocketAddr::from(([0, 0, 0, 0], APP_CONFIG.port));
    let app = serve::router(AppState { admin, oracle });
    info!("listening on {}", addr);

    let server_thread = axum::Server::try_bind(&addr)?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .map_err(anyhow::Error::from);

    let stop_monitor = async {
        server_thread.await?;
        monitor.stop().await;
        Ok::<_, anyhow::Error>(())
    };
    let join_monitor = async {
        if let Some(handle) = monitor_thread {
            handle.await.context("balance monitor task failed")?;
        }
        Ok::<_, anyhow::Error>(())
    };

    try_join!(stop_monitor, join_monitor)?;
    info!("gas alert service stopped");
    Ok(())
}
