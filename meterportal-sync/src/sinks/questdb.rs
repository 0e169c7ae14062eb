use std::time::Duration;

use meterportal_client::{
    db::statistics_queries,
    domain::{StatisticId, StatisticPoint},
};
use sqlx::{postgres::PgPool, Postgres, QueryBuilder, Transaction};
use time::OffsetDateTime;

use crate::pipeline::{SinkError, StatisticBatch, StatisticsSink};

/// Statistics store on QuestDB over pgwire.
///
/// The table deduplicates on `(ts, statistic_id)`, so re-inserting a point
/// replaces it. Every `write`/`write_many` call commits in one transaction,
/// split into `batch_size` inserts.
pub struct QuestDbStatisticsSink {
    pool: PgPool,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

type Row<'a> = (&'a StatisticId, &'a StatisticPoint);

/// Where a page's rows are staged until they all become visible at once.
#[async_trait::async_trait]
trait RowStage: Send {
    async fn insert(&mut self, rows: &[Row<'_>]) -> Result<(), sqlx::Error>;

    async fn commit(self) -> Result<(), sqlx::Error>;
}

#[async_trait::async_trait]
impl RowStage for Transaction<'static, Postgres> {
    async fn insert(&mut self, rows: &[Row<'_>]) -> Result<(), sqlx::Error> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {} (ts, statistic_id, state, cumulative_sum) ",
            statistics_queries::STATISTICS_TABLE
        ));

        builder.push_values(rows, |mut b, (id, point)| {
            b.push_bind(point.ts)
                .push_bind(id.as_str())
                .push_bind(point.state)
                .push_bind(point.sum);
        });

        builder.build().execute(&mut **self).await.map(|_| ())
    }

    async fn commit(self) -> Result<(), sqlx::Error> {
        Transaction::commit(self).await
    }
}

/// Insert `rows` in chunks and commit. An error drops `stage`, discarding
/// every chunk staged so far.
async fn stage_page<S: RowStage>(mut stage: S, rows: &[Row<'_>], batch_size: usize) -> Result<(), sqlx::Error> {
    for chunk in rows.chunks(batch_size) {
        stage.insert(chunk).await?;
    }
    stage.commit().await
}

impl QuestDbStatisticsSink {
    pub fn new(pool: PgPool, batch_size: usize, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
        }
    }

    async fn flush_page(&self, rows: &[Row<'_>]) -> Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut attempt: u32 = 0;
        loop {
            let written = match self.pool.begin().await {
                Ok(tx) => stage_page(tx, rows, self.batch_size).await,
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => {
                    metrics::counter!("statistic_points_written_total").increment(rows.len() as u64);
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        rows = rows.len(),
                        "statistics write failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, rows = rows.len(), "statistics write failed, giving up");
                    metrics::counter!("questdb_sink_errors_total").increment(1);
                    return Err(SinkError::Write(e.to_string()));
                }
            }
        }
    }
}

fn query_error(e: anyhow::Error) -> SinkError {
    metrics::counter!("questdb_sink_errors_total").increment(1);
    SinkError::Query(e.to_string())
}

#[async_trait::async_trait]
impl StatisticsSink for QuestDbStatisticsSink {
    async fn write(&self, statistic_id: &StatisticId, points: &[StatisticPoint]) -> Result<(), SinkError> {
        let rows: Vec<Row<'_>> = points.iter().map(|p| (statistic_id, p)).collect();
        self.flush_page(&rows).await
    }

    async fn write_many(&self, batches: &[StatisticBatch]) -> Result<(), SinkError> {
        let rows: Vec<Row<'_>> = batches
            .iter()
            .flat_map(|(id, points)| points.iter().map(move |p| (id, p)))
            .collect();
        self.flush_page(&rows).await
    }

    async fn last_point(&self, statistic_id: &StatisticId) -> Result<Option<StatisticPoint>, SinkError> {
        statistics_queries::last_point(&self.pool, statistic_id.as_str())
            .await
            .map_err(query_error)
    }

    async fn last_point_before(
        &self,
        statistic_id: &StatisticId,
        before: OffsetDateTime,
    ) -> Result<Option<StatisticPoint>, SinkError> {
        statistics_queries::last_point_before(&self.pool, statistic_id.as_str(), before)
            .await
            .map_err(query_error)
    }

    async fn points_since(
        &self,
        statistic_id: &StatisticId,
        start: OffsetDateTime,
    ) -> Result<Vec<StatisticPoint>, SinkError> {
        statistics_queries::points_since(&self.pool, statistic_id.as_str(), start)
            .await
            .map_err(query_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use time::macros::datetime;

    /// Keeps rows private until commit, like a pgwire transaction.
    #[derive(Default)]
    struct StagedRows {
        visible: Arc<Mutex<Vec<(String, OffsetDateTime)>>>,
        staged: Vec<(String, OffsetDateTime)>,
        fail_after: Option<usize>,
    }

    #[async_trait::async_trait]
    impl RowStage for StagedRows {
        async fn insert(&mut self, rows: &[Row<'_>]) -> Result<(), sqlx::Error> {
            if self.fail_after.is_some_and(|n| self.staged.len() + rows.len() > n) {
                return Err(sqlx::Error::Protocol("connection reset".to_string()));
            }
            self.staged
                .extend(rows.iter().map(|(id, point)| (id.as_str().to_string(), point.ts)));
            Ok(())
        }

        async fn commit(self) -> Result<(), sqlx::Error> {
            self.visible.lock().unwrap().extend(self.staged);
            Ok(())
        }
    }

    fn page() -> (StatisticId, Vec<StatisticPoint>) {
        let points = (0..5)
            .map(|h| StatisticPoint {
                ts: datetime!(2024-06-01 00:00:00 UTC) + time::Duration::hours(h),
                state: h as f64,
                sum: h as f64,
            })
            .collect();
        (StatisticId::new("meterportal:200_coldwater_statistic_primary"), points)
    }

    #[tokio::test]
    async fn failed_chunk_leaves_the_page_unwritten() {
        let (id, points) = page();
        let rows: Vec<Row<'_>> = points.iter().map(|p| (&id, p)).collect();
        let visible = Arc::new(Mutex::new(Vec::new()));

        let stage = StagedRows {
            visible: visible.clone(),
            fail_after: Some(3),
            ..StagedRows::default()
        };
        assert!(stage_page(stage, &rows, 2).await.is_err());
        assert!(visible.lock().unwrap().is_empty());

        let stage = StagedRows {
            visible: visible.clone(),
            ..StagedRows::default()
        };
        stage_page(stage, &rows, 2).await.unwrap();
        let written = visible.lock().unwrap();
        assert_eq!(written.len(), 5);
        assert_eq!(written[4].1, datetime!(2024-06-01 04:00:00 UTC));
    }
}
