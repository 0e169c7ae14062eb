use std::collections::HashMap;

use meterportal_client::domain::{Counter, Reading};
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, macros::datetime, OffsetDateTime, UtcOffset};

use crate::pipeline::RawReading;

/// Why a raw vendor entry was set aside instead of becoming a `Reading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quarantine {
    MissingCounter,
    UnknownCounter,
    MissingTimestamp,
    BadTimestamp,
    MissingValue,
    BadValue,
    OutOfRange,
}

impl Quarantine {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingCounter => "missing_counter",
            Self::UnknownCounter => "unknown_counter",
            Self::MissingTimestamp => "missing_timestamp",
            Self::BadTimestamp => "bad_timestamp",
            Self::MissingValue => "missing_value",
            Self::BadValue => "bad_value",
            Self::OutOfRange => "out_of_range",
        }
    }
}

/// Numeric value of a vendor field. Strings are stripped of everything but
/// digits, `.` and `-` first ("12.5 m3" parses as 12.5).
pub fn parse_value(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                cleaned.parse::<f64>().ok()
            }
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// RFC 3339 timestamp (with `Z` or an explicit offset), converted to UTC.
pub fn parse_timestamp(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s.trim(), &Rfc3339)
        .ok()
        .map(|ts| ts.to_offset(UtcOffset::UTC))
}

/// Pure validation of one raw entry against the counter it claims to belong to.
///
/// Rules:
/// - timestamp must parse and lie within [2000-01-01, 2100-01-01].
/// - value must be numeric and finite.
pub fn validate_reading(raw: &RawReading, counter: &Counter) -> Result<Reading, Quarantine> {
    let ts_raw = raw.timestamp.as_deref().ok_or(Quarantine::MissingTimestamp)?;
    let ts = parse_timestamp(ts_raw).ok_or(Quarantine::BadTimestamp)?;

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);
    if ts < min_ts || ts > max_ts {
        return Err(Quarantine::OutOfRange);
    }

    let value = raw.value.as_ref().ok_or(Quarantine::MissingValue)?;
    let value = parse_value(value).ok_or(Quarantine::BadValue)?;

    Ok(Reading {
        counter_id: counter.counter_id.clone(),
        ts,
        value,
        unit: raw.unit.clone().unwrap_or_else(|| counter.unit.clone()),
    })
}

/// Readings of one page grouped by counter id, in vendor order.
#[derive(Debug, Default)]
pub struct Partitioned {
    pub by_counter: HashMap<String, Vec<Reading>>,
    pub quarantined: usize,
}

impl Partitioned {
    pub fn take(&mut self, counter_id: &str) -> Vec<Reading> {
        self.by_counter.remove(counter_id).unwrap_or_default()
    }
}

/// Validate a page of raw entries and split them per known counter.
///
/// Entries for counters outside `counters` are quarantined too: the vendor
/// returns every counter of an installation in one response.
pub fn partition_by_counter(raws: Vec<RawReading>, counters: &[&Counter]) -> Partitioned {
    let mut out = Partitioned::default();

    for raw in raws {
        let result = match raw.meter_counter_id.as_deref() {
            None => Err(Quarantine::MissingCounter),
            Some(id) => match counters.iter().find(|c| c.counter_id == id) {
                None => Err(Quarantine::UnknownCounter),
                Some(counter) => validate_reading(&raw, counter),
            },
        };

        match result {
            Ok(reading) => out
                .by_counter
                .entry(reading.counter_id.clone())
                .or_default()
                .push(reading),
            Err(Quarantine::UnknownCounter) => {}
            Err(reason) => {
                out.quarantined += 1;
                metrics::counter!("readings_quarantined_total", "reason" => reason.as_str()).increment(1);
                tracing::debug!(reason = reason.as_str(), ?raw, "quarantined vendor reading");
            }
        }
    }

    out
}
