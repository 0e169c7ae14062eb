use anyhow::Result;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::domain::StatisticPoint;

pub const STATISTICS_TABLE: &str = "meter_statistics";

/// DDL for the statistics table. `DEDUP UPSERT KEYS` makes a re-insert of an
/// existing `(ts, statistic_id)` replace the row instead of duplicating it.
pub const CREATE_STATISTICS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS meter_statistics (
        ts TIMESTAMP,
        statistic_id SYMBOL,
        state DOUBLE,
        cumulative_sum DOUBLE
    ) TIMESTAMP(ts) PARTITION BY MONTH WAL
    DEDUP UPSERT KEYS(ts, statistic_id)
"#;

pub async fn ensure_statistics_table(pool: &PgPool) -> Result<()> {
    sqlx::query(CREATE_STATISTICS_TABLE).execute(pool).await?;
    Ok(())
}

/// Most recent point of a statistic.
pub async fn last_point(pool: &PgPool, statistic_id: &str) -> Result<Option<StatisticPoint>> {
    let row = sqlx::query_as::<_, StatisticPoint>(
        r#"
        SELECT ts, state, cumulative_sum
        FROM meter_statistics
        WHERE statistic_id = $1
        ORDER BY ts DESC
        LIMIT 1
        "#,
    )
    .bind(statistic_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Latest point strictly before `before`; the baseline a re-import folds onto.
pub async fn last_point_before(
    pool: &PgPool,
    statistic_id: &str,
    before: OffsetDateTime,
) -> Result<Option<StatisticPoint>> {
    let row = sqlx::query_as::<_, StatisticPoint>(
        r#"
        SELECT ts, state, cumulative_sum
        FROM meter_statistics
        WHERE statistic_id = $1
          AND ts < $2
        ORDER BY ts DESC
        LIMIT 1
        "#,
    )
    .bind(statistic_id)
    .bind(before)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Time-ordered points at or after `start`.
pub async fn points_since(
    pool: &PgPool,
    statistic_id: &str,
    start: OffsetDateTime,
) -> Result<Vec<StatisticPoint>> {
    let rows = sqlx::query_as::<_, StatisticPoint>(
        r#"
        SELECT ts, state, cumulative_sum
        FROM meter_statistics
        WHERE statistic_id = $1
          AND ts >= $2
        ORDER BY ts
        "#,
    )
    .bind(statistic_id)
    .bind(start)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
