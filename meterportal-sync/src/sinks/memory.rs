use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

use meterportal_client::domain::{StatisticId, StatisticPoint};
use time::OffsetDateTime;

use crate::pipeline::{SinkError, StatisticBatch, StatisticsSink};

/// Statistics kept in process, upserting on timestamp like the real table.
#[derive(Default)]
pub struct MemorySink {
    series: Mutex<HashMap<StatisticId, BTreeMap<OffsetDateTime, StatisticPoint>>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    /// Successful `write`/`write_many` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn points(&self, statistic_id: &StatisticId) -> Vec<StatisticPoint> {
        self.series
            .lock()
            .unwrap()
            .get(statistic_id)
            .map(|s| s.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn seed(&self, statistic_id: &StatisticId, points: &[StatisticPoint]) {
        let mut series = self.series.lock().unwrap();
        let entry = series.entry(statistic_id.clone()).or_default();
        for p in points {
            entry.insert(p.ts, *p);
        }
    }
}

#[async_trait::async_trait]
impl StatisticsSink for MemorySink {
    async fn write(&self, statistic_id: &StatisticId, points: &[StatisticPoint]) -> Result<(), SinkError> {
        self.write_many(&[(statistic_id.clone(), points.to_vec())]).await
    }

    async fn write_many(&self, batches: &[StatisticBatch]) -> Result<(), SinkError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SinkError::Write("sink unavailable".to_string()));
        }
        for (id, points) in batches {
            self.seed(id, points);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn last_point(&self, statistic_id: &StatisticId) -> Result<Option<StatisticPoint>, SinkError> {
        Ok(self.points(statistic_id).last().copied())
    }

    async fn last_point_before(
        &self,
        statistic_id: &StatisticId,
        before: OffsetDateTime,
    ) -> Result<Option<StatisticPoint>, SinkError> {
        Ok(self
            .points(statistic_id)
            .into_iter()
            .filter(|p| p.ts < before)
            .last())
    }

    async fn points_since(
        &self,
        statistic_id: &StatisticId,
        start: OffsetDateTime,
    ) -> Result<Vec<StatisticPoint>, SinkError> {
        Ok(self
            .points(statistic_id)
            .into_iter()
            .filter(|p| p.ts >= start)
            .collect())
    }
}
