use time::OffsetDateTime;

/// A validated point-in-time value reported by the vendor for one counter.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub counter_id: String,
    pub ts: OffsetDateTime,
    pub value: f64,
    pub unit: String,
}
