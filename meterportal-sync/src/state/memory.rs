use std::sync::Mutex;

use meterportal_client::domain::StatisticId;
use time::OffsetDateTime;

use super::{PollConfig, PollConfigStore, Snapshot, StateError, WatermarkStore};

/// Non-persistent store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshot: Mutex<Snapshot>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Snapshot) -> R) -> R {
        let mut guard = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

#[async_trait::async_trait]
impl WatermarkStore for MemoryStateStore {
    async fn watermark(&self, statistic_id: &StatisticId) -> Result<Option<OffsetDateTime>, StateError> {
        Ok(self.with(|s| s.watermark(statistic_id)))
    }

    async fn advance(&self, statistic_id: &StatisticId, to: OffsetDateTime) -> Result<(), StateError> {
        self.with(|s| s.advance(statistic_id, to));
        Ok(())
    }
}

#[async_trait::async_trait]
impl PollConfigStore for MemoryStateStore {
    async fn poll_config(&self, account_id: &str) -> Result<Option<PollConfig>, StateError> {
        Ok(self.with(|s| s.poll_configs.get(account_id).copied()))
    }

    async fn set_poll_config(&self, account_id: &str, config: PollConfig) -> Result<(), StateError> {
        self.with(|s| s.poll_configs.insert(account_id.to_string(), config));
        Ok(())
    }
}
