use std::{fmt, pin::Pin, time::Duration};

use futures::Stream;
use meterportal_client::domain::{Meter, StatisticId, StatisticPoint};
use time::OffsetDateTime;

use crate::state::{IntervalOutOfRange, StateError};

/// Failure of a vendor fetch. Aborts the batch it happened in.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Credentials were rejected; polling stays off until they are replaced.
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// Network failure, timeout, 5xx or an undecodable payload.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rate limited by vendor")]
    RateLimited { retry_after: Option<Duration> },
}

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("statistics write failed: {0}")]
    Write(String),
    #[error("statistics query failed: {0}")]
    Query(String),
}

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("unknown statistic: {0}")]
    UnknownStatistic(String),
    #[error("unknown account: {0}")]
    UnknownAccount(String),
    #[error("invalid range: from_days_ago ({from_days_ago}) must be greater than to_days_ago ({to_days_ago}) and to_days_ago must not be negative")]
    InvalidRange { from_days_ago: i64, to_days_ago: i64 },
    #[error(transparent)]
    InvalidInterval(#[from] IntervalOutOfRange),
    #[error("request cancelled before it started")]
    Cancelled,
    #[error("sync task failed: {0}")]
    Task(String),
}

/// API key of one vendor account.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// A reading exactly as the vendor shaped it; nothing is trusted yet.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RawReading {
    #[serde(rename = "meterCounterId", default)]
    pub meter_counter_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// All readings returned by one vendor request.
///
/// A page is the unit of atomicity: it is reconciled and written as a whole
/// or not at all.
#[derive(Debug, Clone)]
pub struct ReadingPage {
    pub from: OffsetDateTime,
    pub to: OffsetDateTime,
    pub readings: Vec<RawReading>,
}

pub type ReadingStream = Pin<Box<dyn Stream<Item = Result<ReadingPage, FetchError>> + Send>>;

/// Vendor adapter. The returned stream is lazy: no request is made until it
/// is polled, and pages come back in ascending time order.
pub trait ReadingSource: Send + Sync {
    fn fetch(
        &self,
        credentials: &Credentials,
        meter_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> ReadingStream;
}

/// Lists the meters an account can read, with the counters the engine
/// accumulates.
#[async_trait::async_trait]
pub trait MeterDiscovery: Send + Sync {
    async fn discover(
        &self,
        credentials: &Credentials,
        allowlist: Option<&[String]>,
    ) -> Result<Vec<Meter>, FetchError>;
}

/// Points of one statistic, oldest first.
pub type StatisticBatch = (StatisticId, Vec<StatisticPoint>);

/// Long-term statistics store. Writes are idempotent on `(statistic, ts)`.
#[async_trait::async_trait]
pub trait StatisticsSink: Send + Sync {
    async fn write(&self, statistic_id: &StatisticId, points: &[StatisticPoint]) -> Result<(), SinkError>;

    /// Write several statistics as one unit where the store allows it.
    async fn write_many(&self, batches: &[StatisticBatch]) -> Result<(), SinkError> {
        for (statistic_id, points) in batches {
            self.write(statistic_id, points).await?;
        }
        Ok(())
    }

    async fn last_point(&self, statistic_id: &StatisticId) -> Result<Option<StatisticPoint>, SinkError>;

    async fn last_point_before(
        &self,
        statistic_id: &StatisticId,
        before: OffsetDateTime,
    ) -> Result<Option<StatisticPoint>, SinkError>;

    async fn points_since(
        &self,
        statistic_id: &StatisticId,
        start: OffsetDateTime,
    ) -> Result<Vec<StatisticPoint>, SinkError>;
}
