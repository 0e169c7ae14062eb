use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::meter::Counter;

/// Deterministic identifier of a cumulative statistic series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatisticId(String);

impl StatisticId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `{prefix}:{installation}_{countertype}_statistic_{primary|secondary}`
    pub fn cumulative(prefix: &str, meter_id: &str, counter: &Counter) -> Self {
        Self(format!(
            "{prefix}:{meter_id}_{}_statistic_{}",
            counter.counter_type.as_str().to_lowercase(),
            counter.suffix()
        ))
    }

    /// Derived import-minus-export series of an electricity installation.
    pub fn net_consumption(prefix: &str, meter_id: &str) -> Self {
        Self(format!("{prefix}:{meter_id}_electricity_net_statistic"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StatisticId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of the raw meter-reading sensor that sits next to a statistic.
pub fn meter_reading_sensor_name(meter_id: &str, counter: &Counter) -> String {
    format!(
        "{meter_id}_{}_meter_{}",
        counter.counter_type.as_str().to_lowercase(),
        counter.suffix()
    )
}

/// One hourly row of a cumulative statistic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StatisticPoint {
    #[serde(with = "time::serde::timestamp")]
    pub ts: OffsetDateTime,
    pub state: f64,
    #[sqlx(rename = "cumulative_sum")]
    pub sum: f64,
}
