use anyhow::Result;
use meterportal_sync::{
    api::{self, ApiState},
    app::App,
    config::AppConfig,
    metrics_server, observability,
    scheduler::Scheduler,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    let shutdown = CancellationToken::new();
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(metrics_cfg, shutdown.clone())?;
    }

    let app = App::build(&cfg).await?;

    let scheduler = Arc::new(Scheduler::new(
        app.engine.clone(),
        app.registry.clone(),
        app.client.clone(),
        cfg.sync.rate_limit_cooldown(),
    ));
    let mut account_tasks = scheduler.spawn(&app.accounts, shutdown.clone());

    let api_state = ApiState {
        backfill: app.backfill.clone(),
        accounts: app.accounts.clone(),
        registry: app.registry.clone(),
        poll_store: app.state.clone(),
        shutdown: shutdown.clone(),
    };
    let bind_addr = cfg.api.bind_addr.clone();
    let api_task = tokio::spawn(async move { api::serve(&bind_addr, api_state).await });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutting down");
        }
        res = api_task => {
            match res {
                Ok(Ok(())) => tracing::warn!("command api stopped"),
                Ok(Err(e)) => tracing::error!(error = %e, "command api failed"),
                Err(e) => tracing::error!(error = %e, "command api task failed"),
            }
        }
    }

    shutdown.cancel();
    while let Some(res) = account_tasks.join_next().await {
        if let Err(e) = res {
            tracing::error!(error = %e, "account task failed");
        }
    }
    tracing::info!("stopped");

    Ok(())
}
