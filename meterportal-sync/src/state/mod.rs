//! Persisted engine state: one watermark per statistic and one poll
//! configuration per account.

use std::{collections::BTreeMap, time::Duration};

use meterportal_client::domain::StatisticId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error("state i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("update interval of {0} minutes is outside [{min}, {max}]", min = PollConfig::MIN_MINUTES, max = PollConfig::MAX_MINUTES)]
pub struct IntervalOutOfRange(pub u32);

/// Per-account polling settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    update_interval_minutes: u32,
}

impl PollConfig {
    pub const MIN_MINUTES: u32 = 15;
    pub const MAX_MINUTES: u32 = 120;
    pub const DEFAULT_MINUTES: u32 = 30;

    pub fn new(update_interval_minutes: u32) -> Result<Self, IntervalOutOfRange> {
        if (Self::MIN_MINUTES..=Self::MAX_MINUTES).contains(&update_interval_minutes) {
            Ok(Self {
                update_interval_minutes,
            })
        } else {
            Err(IntervalOutOfRange(update_interval_minutes))
        }
    }

    pub fn update_interval_minutes(&self) -> u32 {
        self.update_interval_minutes
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.update_interval_minutes) * 60)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            update_interval_minutes: Self::DEFAULT_MINUTES,
        }
    }
}

#[async_trait::async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn watermark(&self, statistic_id: &StatisticId) -> Result<Option<OffsetDateTime>, StateError>;

    /// Move the watermark forward. An older `to` leaves it where it is.
    async fn advance(&self, statistic_id: &StatisticId, to: OffsetDateTime) -> Result<(), StateError>;
}

#[async_trait::async_trait]
pub trait PollConfigStore: Send + Sync {
    async fn poll_config(&self, account_id: &str) -> Result<Option<PollConfig>, StateError>;

    async fn set_poll_config(&self, account_id: &str, config: PollConfig) -> Result<(), StateError>;
}

pub trait StateStore: WatermarkStore + PollConfigStore {}

impl<T: WatermarkStore + PollConfigStore> StateStore for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct WatermarkEntry {
    #[serde(with = "time::serde::rfc3339")]
    ts: OffsetDateTime,
}

/// Everything that is persisted, as one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    watermarks: BTreeMap<String, WatermarkEntry>,
    #[serde(default)]
    poll_configs: BTreeMap<String, PollConfig>,
}

impl Snapshot {
    fn watermark(&self, statistic_id: &StatisticId) -> Option<OffsetDateTime> {
        self.watermarks.get(statistic_id.as_str()).map(|e| e.ts)
    }

    /// Returns whether anything changed.
    fn advance(&mut self, statistic_id: &StatisticId, to: OffsetDateTime) -> bool {
        match self.watermarks.get_mut(statistic_id.as_str()) {
            Some(entry) if entry.ts >= to => false,
            Some(entry) => {
                entry.ts = to;
                true
            }
            None => {
                self.watermarks
                    .insert(statistic_id.as_str().to_string(), WatermarkEntry { ts: to });
                true
            }
        }
    }

    /// Drops poll configs a hand-edited file may have pushed out of range.
    fn sanitize(&mut self) {
        self.poll_configs.retain(|account, config| {
            let ok = PollConfig::new(config.update_interval_minutes).is_ok();
            if !ok {
                tracing::warn!(
                    account_id = %account,
                    minutes = config.update_interval_minutes,
                    "ignoring persisted poll config outside the allowed range"
                );
            }
            ok
        });
    }
}
