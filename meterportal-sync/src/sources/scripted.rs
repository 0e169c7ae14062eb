//! In-process vendor used by engine, scheduler and API tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use meterportal_client::domain::{Counter, CounterType, Meter, ReadingKind};
use time::{format_description::well_known::Rfc3339, OffsetDateTime, UtcOffset};

use super::meterportal::{split_windows, DEFAULT_MAX_WINDOW_DAYS};
use crate::{
    pipeline::{
        Credentials, FetchError, MeterDiscovery, RawReading, ReadingPage, ReadingSource, ReadingStream,
    },
    transform::parse_timestamp,
};

#[derive(Debug, Clone, PartialEq)]
pub struct FetchCall {
    pub meter_id: String,
    pub from: OffsetDateTime,
    pub to: OffsetDateTime,
}

struct Failure {
    after_pages: usize,
    error: FetchError,
}

/// Serves readings from an in-memory list, split into the same day windows
/// as the real client. Queued failures are consumed one per `fetch`.
#[derive(Default)]
pub struct ScriptedSource {
    meters: Vec<Meter>,
    readings: Mutex<Vec<RawReading>>,
    failures: Mutex<VecDeque<Failure>>,
    discover_failures: Mutex<VecDeque<FetchError>>,
    calls: Mutex<Vec<FetchCall>>,
    discover_calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(meters: Vec<Meter>) -> Self {
        Self {
            meters,
            ..Self::default()
        }
    }

    pub fn push_reading(&self, counter_id: &str, ts: OffsetDateTime, value: f64) {
        self.push_raw(RawReading {
            meter_counter_id: Some(counter_id.to_string()),
            timestamp: Some(ts.format(&Rfc3339).unwrap()),
            value: Some(serde_json::json!(value)),
            unit: None,
        });
    }

    pub fn push_raw(&self, raw: RawReading) {
        self.readings.lock().unwrap().push(raw);
    }

    /// Next `fetch` fails before yielding anything.
    pub fn fail_next(&self, error: FetchError) {
        self.fail_after(0, error);
    }

    /// Next `fetch` yields `pages` pages, then fails.
    pub fn fail_after(&self, pages: usize, error: FetchError) {
        self.failures.lock().unwrap().push_back(Failure {
            after_pages: pages,
            error,
        });
    }

    pub fn fail_next_discovery(&self, error: FetchError) {
        self.discover_failures.lock().unwrap().push_back(error);
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn discover_count(&self) -> usize {
        self.discover_calls.load(Ordering::SeqCst)
    }

    fn page(&self, start: time::Date, end: time::Date) -> ReadingPage {
        let from = start.midnight().assume_offset(UtcOffset::UTC);
        let to = end.midnight().assume_offset(UtcOffset::UTC) + time::Duration::days(1)
            - time::Duration::SECOND;
        let readings = self
            .readings
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                match r.timestamp.as_deref().and_then(parse_timestamp) {
                    Some(ts) => ts >= from && ts <= to,
                    // Unparseable entries ride along with every page.
                    None => true,
                }
            })
            .cloned()
            .collect();
        ReadingPage { from, to, readings }
    }
}

impl ReadingSource for ScriptedSource {
    fn fetch(
        &self,
        _credentials: &Credentials,
        meter_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> ReadingStream {
        self.calls.lock().unwrap().push(FetchCall {
            meter_id: meter_id.to_string(),
            from,
            to,
        });

        let failure = self.failures.lock().unwrap().pop_front();
        let mut items: Vec<Result<ReadingPage, FetchError>> = split_windows(from, to, DEFAULT_MAX_WINDOW_DAYS)
            .into_iter()
            .map(|(start, end)| Ok(self.page(start, end)))
            .collect();
        if let Some(failure) = failure {
            items.truncate(failure.after_pages);
            items.push(Err(failure.error));
        }

        Box::pin(futures::stream::iter(items))
    }
}

#[async_trait::async_trait]
impl MeterDiscovery for ScriptedSource {
    async fn discover(
        &self,
        _credentials: &Credentials,
        allowlist: Option<&[String]>,
    ) -> Result<Vec<Meter>, FetchError> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.discover_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(self
            .meters
            .iter()
            .filter(|m| allowlist.map_or(true, |ids| ids.contains(&m.meter_id)))
            .cloned()
            .collect())
    }
}

fn counter(id: &str, counter_type: CounterType, reading_kind: ReadingKind, is_primary: bool) -> Counter {
    Counter {
        counter_id: id.to_string(),
        counter_type,
        reading_kind,
        is_primary,
        unit: counter_type.unit().to_string(),
    }
}

/// Electricity installation with import counter `{id}-imp` and export
/// counter `{id}-exp`, both cumulative.
pub fn electricity_meter(id: &str) -> Meter {
    Meter {
        meter_id: id.to_string(),
        installation_type: "Electricity".to_string(),
        label: format!("Test street 1 - {id}"),
        counters: vec![
            counter(&format!("{id}-imp"), CounterType::ElectricityFromGrid, ReadingKind::Counter, true),
            counter(&format!("{id}-exp"), CounterType::ElectricityToGrid, ReadingKind::Counter, false),
        ],
    }
}

/// Cold water installation with one cumulative counter `{id}-cw`.
pub fn water_meter(id: &str) -> Meter {
    Meter {
        meter_id: id.to_string(),
        installation_type: "ColdWater".to_string(),
        label: format!("Test street 2 - {id}"),
        counters: vec![counter(&format!("{id}-cw"), CounterType::ColdWater, ReadingKind::Counter, true)],
    }
}
