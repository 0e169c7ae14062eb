//! Wiring shared by the service and the command-line tools.

use std::{sync::Arc, time::Duration};

use meterportal_client::db::statistics_queries;
use sqlx::postgres::PgPoolOptions;

use crate::{
    backfill::BackfillHandler,
    clock::SystemClock,
    config::AppConfig,
    pipeline::Credentials,
    registry::Registry,
    scheduler::{AccountHandle, AccountSet},
    sinks::QuestDbStatisticsSink,
    sources::MeterportalClient,
    state::{FileStateStore, PollConfigStore},
    sync::SyncEngine,
};

pub struct App {
    pub client: Arc<MeterportalClient>,
    pub state: Arc<FileStateStore>,
    pub engine: Arc<SyncEngine>,
    pub registry: Arc<Registry>,
    pub accounts: Arc<AccountSet>,
    pub backfill: Arc<BackfillHandler>,
}

impl App {
    pub async fn build(cfg: &AppConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.questdb.max_connections)
            .connect(&cfg.questdb.uri)
            .await?;
        if cfg.questdb.create_schema {
            statistics_queries::ensure_statistics_table(&pool).await?;
        }
        let sink = Arc::new(QuestDbStatisticsSink::new(
            pool,
            cfg.sink.batch_size,
            cfg.sink.max_retries,
            Duration::from_millis(cfg.sink.retry_backoff_ms),
        ));

        let state = Arc::new(FileStateStore::open(&cfg.state.path).await?);
        let client = Arc::new(MeterportalClient::new(
            &cfg.vendor.base_url,
            Duration::from_secs(cfg.vendor.request_timeout_secs),
            cfg.vendor.max_window_days,
        )?);

        let engine = Arc::new(SyncEngine::new(
            client.clone(),
            sink,
            state.clone(),
            Arc::new(SystemClock),
            cfg.sync.engine_settings(),
        ));
        let registry = Arc::new(Registry::new(cfg.sync.statistic_prefix.as_str()));

        let mut handles = Vec::with_capacity(cfg.accounts.len());
        for account in &cfg.accounts {
            // An interval changed at runtime outlives the file value.
            let poll = match state.poll_config(&account.id).await? {
                Some(persisted) => persisted,
                None => account.poll_config()?,
            };
            handles.push(AccountHandle::new(
                account.id.as_str(),
                account.email.clone(),
                Credentials::new(account.api_key.as_str()),
                poll,
                account.installations.clone(),
            ));
        }
        let accounts = Arc::new(AccountSet::new(handles));

        let backfill = Arc::new(BackfillHandler::new(
            engine.clone(),
            registry.clone(),
            client.clone(),
            accounts.clone(),
        ));

        tracing::info!(
            accounts = cfg.accounts.len(),
            state_path = %cfg.state.path.display(),
            "sync service initialised"
        );

        Ok(Self {
            client,
            state,
            engine,
            registry,
            accounts,
            backfill,
        })
    }
}
