//! Out-of-band re-import of a historical window for one statistic.

use std::sync::Arc;

use meterportal_client::domain::StatisticId;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;

use crate::{
    pipeline::{MeterDiscovery, SyncError},
    registry::Registry,
    scheduler::AccountSet,
    sync::SyncEngine,
};

pub const DEFAULT_FROM_DAYS_AGO: i64 = 60;
pub const DEFAULT_TO_DAYS_AGO: i64 = 30;

fn default_from_days_ago() -> i64 {
    DEFAULT_FROM_DAYS_AGO
}

fn default_to_days_ago() -> i64 {
    DEFAULT_TO_DAYS_AGO
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub statistic_id: String,
    #[serde(default = "default_from_days_ago")]
    pub from_days_ago: i64,
    #[serde(default = "default_to_days_ago")]
    pub to_days_ago: i64,
}

impl BackfillRequest {
    pub fn new(statistic_id: impl Into<String>) -> Self {
        Self {
            statistic_id: statistic_id.into(),
            from_days_ago: DEFAULT_FROM_DAYS_AGO,
            to_days_ago: DEFAULT_TO_DAYS_AGO,
        }
    }

    pub fn with_range(mut self, from_days_ago: i64, to_days_ago: i64) -> Self {
        self.from_days_ago = from_days_ago;
        self.to_days_ago = to_days_ago;
        self
    }

    /// `from_days_ago > to_days_ago >= 0`
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.to_days_ago < 0 || self.from_days_ago <= self.to_days_ago {
            return Err(self.invalid_range());
        }
        Ok(())
    }

    /// Absolute `[from, to]` relative to `now`. Ranges reaching outside the
    /// representable calendar are rejected like any other invalid range.
    pub fn window(&self, now: OffsetDateTime) -> Result<(OffsetDateTime, OffsetDateTime), SyncError> {
        self.validate()?;
        let days_back = |days: i64| {
            days.checked_mul(86_400)
                .map(Duration::seconds)
                .and_then(|back| now.checked_sub(back))
        };
        match (days_back(self.from_days_ago), days_back(self.to_days_ago)) {
            (Some(from), Some(to)) => Ok((from, to)),
            _ => Err(self.invalid_range()),
        }
    }

    fn invalid_range(&self) -> SyncError {
        SyncError::InvalidRange {
            from_days_ago: self.from_days_ago,
            to_days_ago: self.to_days_ago,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillOutcome {
    pub statistic_id: String,
    pub points_written: usize,
    pub anomalies: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub from: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub to: OffsetDateTime,
}

pub struct BackfillHandler {
    engine: Arc<SyncEngine>,
    registry: Arc<Registry>,
    discovery: Arc<dyn MeterDiscovery>,
    accounts: Arc<AccountSet>,
}

impl BackfillHandler {
    pub fn new(
        engine: Arc<SyncEngine>,
        registry: Arc<Registry>,
        discovery: Arc<dyn MeterDiscovery>,
        accounts: Arc<AccountSet>,
    ) -> Self {
        Self {
            engine,
            registry,
            discovery,
            accounts,
        }
    }

    /// Re-import the request's window, waiting for the meter's lock.
    ///
    /// `cancel` is honoured only while waiting for the lock. Once the batch
    /// has started it runs to completion even if the caller goes away.
    pub async fn fetch_more_history(
        &self,
        request: BackfillRequest,
        cancel: &CancellationToken,
    ) -> Result<BackfillOutcome, SyncError> {
        let result = self.run(&request, cancel).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(SyncError::InvalidRange { .. }) => "invalid_range",
            Err(SyncError::UnknownStatistic(_)) => "unknown_statistic",
            Err(SyncError::Cancelled) => "cancelled",
            Err(_) => "error",
        };
        metrics::counter!("backfill_requests_total", "outcome" => outcome).increment(1);

        match &result {
            Ok(done) => tracing::info!(
                statistic_id = %done.statistic_id,
                points = done.points_written,
                anomalies = done.anomalies,
                "backfill finished"
            ),
            Err(e) => tracing::warn!(
                statistic_id = %request.statistic_id,
                error = %e,
                "backfill failed"
            ),
        }
        result
    }

    async fn run(
        &self,
        request: &BackfillRequest,
        cancel: &CancellationToken,
    ) -> Result<BackfillOutcome, SyncError> {
        let (from, to) = request.window(self.engine.clock().now())?;

        let statistic_id = StatisticId::new(request.statistic_id.as_str());
        let resolved = match self.registry.resolve(&statistic_id).await {
            Some(resolved) => resolved,
            None => {
                self.discover_missing().await?;
                self.registry
                    .resolve(&statistic_id)
                    .await
                    .ok_or_else(|| SyncError::UnknownStatistic(request.statistic_id.clone()))?
            }
        };
        let account = self
            .accounts
            .get(&resolved.plan.account_id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownAccount(resolved.plan.account_id.clone()))?;

        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            guard = account.locks().acquire(resolved.plan.meter_id()) => guard,
        };

        tracing::info!(
            statistic_id = %statistic_id,
            meter_id = resolved.plan.meter_id(),
            from = %from,
            to = %to,
            "backfill started"
        );

        let engine = self.engine.clone();
        let credentials = account.credentials();
        let batch = tokio::spawn(async move {
            engine
                .backfill_meter(&guard, &credentials, &resolved.plan, &resolved.targets, from, to)
                .await
        });
        let report = batch
            .await
            .map_err(|e| SyncError::Task(e.to_string()))??;

        Ok(BackfillOutcome {
            statistic_id: request.statistic_id.clone(),
            points_written: report.points_written,
            anomalies: report.anomalies,
            from,
            to,
        })
    }

    /// Discover meters for accounts the scheduler has not reached yet.
    async fn discover_missing(&self) -> Result<(), SyncError> {
        for account in self.accounts.iter() {
            if self.registry.plans(account.id()).await.is_some() {
                continue;
            }
            let meters = self
                .discovery
                .discover(&account.credentials(), account.allowlist())
                .await?;
            self.registry.install(account.id(), meters).await;
        }
        Ok(())
    }
}
