use std::time::{Duration, Instant};

use async_stream::try_stream;
use meterportal_client::domain::{Counter, CounterType, Meter, ReadingKind};
use reqwest::{header::RETRY_AFTER, Response, StatusCode};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime, UtcOffset};

use crate::pipeline::{
    Credentials, FetchError, MeterDiscovery, RawReading, ReadingPage, ReadingSource, ReadingStream,
};

pub const DEFAULT_BASE_URL: &str = "https://api.gateway.meterportal.eu/v1/smarthome";
pub const DEFAULT_MAX_WINDOW_DAYS: u32 = 31;

const API_KEY_HEADER: &str = "ApiKey";

/// HTTP client for the Målerportal smarthome API.
#[derive(Clone)]
pub struct MeterportalClient {
    http: reqwest::Client,
    base_url: String,
    max_window_days: u32,
}

/// An installation as listed under the account's addresses.
#[derive(Debug, Clone, PartialEq)]
pub struct Installation {
    pub installation_id: String,
    pub installation_type: String,
    pub address: Option<String>,
    pub meter_serial: Option<String>,
    pub utility_name: Option<String>,
    pub nickname: Option<String>,
}

impl Installation {
    /// "Address - serial (nickname)"
    pub fn label(&self) -> String {
        let mut label = format!(
            "{} - {}",
            self.address.as_deref().unwrap_or("Unknown"),
            self.meter_serial.as_deref().unwrap_or("Unknown"),
        );
        if let Some(nick) = self.nickname.as_deref().filter(|n| !n.is_empty()) {
            label.push_str(&format!(" ({nick})"));
        }
        label
    }
}

#[derive(Debug, Deserialize)]
struct AddressDto {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    installations: Vec<InstallationDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstallationDto {
    installation_id: Option<String>,
    #[serde(default)]
    installation_type: Option<String>,
    #[serde(default)]
    meter_serial: Option<String>,
    #[serde(default)]
    utility_name: Option<String>,
    #[serde(default)]
    nickname: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestDto {
    #[serde(default)]
    meter_counters: Vec<CounterDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CounterDto {
    meter_counter_id: Option<String>,
    #[serde(default)]
    counter_type: Option<String>,
    #[serde(default)]
    reading_type: Option<String>,
    #[serde(default)]
    is_primary: bool,
    #[serde(default)]
    unit: Option<String>,
}

impl CounterDto {
    /// `None` for counters that never become a statistic.
    fn into_counter(self) -> Option<Counter> {
        let counter_id = self.meter_counter_id?;
        let counter_type = CounterType::parse(self.counter_type.as_deref()?)?;
        Some(Counter {
            counter_id,
            counter_type,
            reading_kind: self
                .reading_type
                .as_deref()
                .map(ReadingKind::parse)
                .unwrap_or_default(),
            is_primary: self.is_primary,
            unit: self
                .unit
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| counter_type.unit().to_string()),
        })
    }
}

#[derive(Debug, Serialize)]
struct HistoricalRequest {
    from: String,
    to: String,
}

#[derive(Debug, Default, Deserialize)]
struct HistoricalDto {
    #[serde(default)]
    readings: Vec<RawReading>,
}

impl MeterportalClient {
    pub fn new(base_url: &str, request_timeout: Duration, max_window_days: u32) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_window_days: max_window_days.max(1),
        })
    }

    /// `GET /addresses`, flattened to the installations under them.
    pub async fn installations(&self, credentials: &Credentials) -> Result<Vec<Installation>, FetchError> {
        let url = format!("{}/addresses", self.base_url);
        let resp = self
            .http
            .get(url)
            .header(API_KEY_HEADER, &credentials.api_key)
            .send()
            .await
            .map_err(transport)?;
        let addresses: Vec<AddressDto> = check_status(resp)?.json().await.map_err(transport)?;

        Ok(addresses
            .into_iter()
            .flat_map(|a| {
                let address = a.address;
                a.installations.into_iter().filter_map(move |i| {
                    Some(Installation {
                        installation_id: i.installation_id?,
                        installation_type: i.installation_type.unwrap_or_else(|| "Unknown".to_string()),
                        address: address.clone(),
                        meter_serial: i.meter_serial,
                        utility_name: i.utility_name,
                        nickname: i.nickname,
                    })
                })
            })
            .collect())
    }

    /// Accumulating counters of one installation, from its latest readings.
    pub async fn meter_counters(
        &self,
        credentials: &Credentials,
        installation_id: &str,
    ) -> Result<Vec<Counter>, FetchError> {
        let url = format!("{}/installations/{}/readings/latest", self.base_url, installation_id);
        let resp = self
            .http
            .get(url)
            .header(API_KEY_HEADER, &credentials.api_key)
            .send()
            .await
            .map_err(transport)?;
        let latest: LatestDto = check_status(resp)?.json().await.map_err(transport)?;

        Ok(latest
            .meter_counters
            .into_iter()
            .filter_map(CounterDto::into_counter)
            .collect())
    }

    /// One `readings/historical` request covering whole days `[start, end]`.
    async fn historical(
        &self,
        credentials: &Credentials,
        installation_id: &str,
        start: Date,
        end: Date,
    ) -> Result<ReadingPage, FetchError> {
        let url = format!(
            "{}/installations/{}/readings/historical",
            self.base_url, installation_id
        );
        let body = HistoricalRequest {
            from: format!("{}T00:00:00Z", iso_date(start)),
            to: format!("{}T23:59:59Z", iso_date(end)),
        };

        let started = Instant::now();
        let result: Result<HistoricalDto, FetchError> = async {
            let resp = self
                .http
                .post(url)
                .header(API_KEY_HEADER, &credentials.api_key)
                .json(&body)
                .send()
                .await
                .map_err(transport)?;
            check_status(resp)?
                .json::<HistoricalDto>()
                .await
                .map_err(transport)
        }
        .await;
        metrics::histogram!("vendor_fetch_latency_seconds").record(started.elapsed().as_secs_f64());

        let dto = result.map_err(|e| {
            metrics::counter!("vendor_fetch_errors_total", "kind" => error_kind(&e)).increment(1);
            e
        })?;
        metrics::counter!("readings_fetched_total").increment(dto.readings.len() as u64);

        let from = start.midnight().assume_offset(UtcOffset::UTC);
        let to = end.midnight().assume_offset(UtcOffset::UTC) + time::Duration::days(1)
            - time::Duration::SECOND;
        tracing::debug!(
            installation_id,
            from = %body.from,
            to = %body.to,
            readings = dto.readings.len(),
            "fetched historical readings"
        );

        Ok(ReadingPage {
            from,
            to,
            readings: dto.readings,
        })
    }
}

impl ReadingSource for MeterportalClient {
    fn fetch(
        &self,
        credentials: &Credentials,
        meter_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> ReadingStream {
        let client = self.clone();
        let credentials = credentials.clone();
        let meter_id = meter_id.to_string();
        let windows = split_windows(from, to, self.max_window_days);

        Box::pin(try_stream! {
            for (start, end) in windows {
                let page = client.historical(&credentials, &meter_id, start, end).await?;
                yield page;
            }
        })
    }
}

#[async_trait::async_trait]
impl MeterDiscovery for MeterportalClient {
    async fn discover(
        &self,
        credentials: &Credentials,
        allowlist: Option<&[String]>,
    ) -> Result<Vec<Meter>, FetchError> {
        let mut meters = Vec::new();
        for installation in self.installations(credentials).await? {
            if let Some(allowed) = allowlist {
                if !allowed.iter().any(|id| *id == installation.installation_id) {
                    continue;
                }
            }

            let counters = self
                .meter_counters(credentials, &installation.installation_id)
                .await?;
            if counters.is_empty() {
                tracing::info!(
                    installation_id = %installation.installation_id,
                    "installation has no accumulating counters, ignoring"
                );
                continue;
            }

            meters.push(Meter {
                label: installation.label(),
                meter_id: installation.installation_id,
                installation_type: installation.installation_type,
                counters,
            });
        }
        Ok(meters)
    }
}

/// Consecutive whole-day windows covering `[from, to]`, each at most
/// `max_days` long.
pub fn split_windows(from: OffsetDateTime, to: OffsetDateTime, max_days: u32) -> Vec<(Date, Date)> {
    let first = from.to_offset(UtcOffset::UTC).date();
    let last = to.to_offset(UtcOffset::UTC).date();
    let span = time::Duration::days(i64::from(max_days.max(1)) - 1);

    let mut windows = Vec::new();
    let mut start = first;
    while start <= last {
        let end = start.checked_add(span).map_or(last, |e| e.min(last));
        windows.push((start, end));
        match end.next_day() {
            Some(next) => start = next,
            None => break,
        }
    }
    windows
}

/// Maps a non-success vendor status onto the fetch error taxonomy.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> FetchError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            FetchError::Auth(format!("vendor rejected credentials ({status})"))
        }
        _ => FetchError::Transport(format!("vendor returned {status}")),
    }
}

fn check_status(resp: Response) -> Result<Response, FetchError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    Err(classify_status(status, retry_after))
}

fn transport(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Transport("request timed out".to_string())
    } else if e.is_decode() {
        FetchError::Transport(format!("undecodable vendor payload: {e}"))
    } else {
        FetchError::Transport(e.to_string())
    }
}

fn error_kind(e: &FetchError) -> &'static str {
    match e {
        FetchError::Auth(_) => "auth",
        FetchError::Transport(_) => "transport",
        FetchError::RateLimited { .. } => "rate_limited",
    }
}

fn iso_date(d: Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), u8::from(d.month()), d.day())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[test]
    fn windows_are_capped_and_contiguous() {
        let windows = split_windows(
            datetime!(2024-01-01 10:00:00 UTC),
            datetime!(2024-03-05 08:00:00 UTC),
            31,
        );
        assert_eq!(
            windows,
            vec![
                (date!(2024-01-01), date!(2024-01-31)),
                (date!(2024-02-01), date!(2024-03-02)),
                (date!(2024-03-03), date!(2024-03-05)),
            ]
        );
    }

    #[test]
    fn same_day_range_is_one_window_and_inverted_range_is_none() {
        let day = datetime!(2024-06-01 12:00:00 UTC);
        assert_eq!(split_windows(day, day, 31), vec![(date!(2024-06-01), date!(2024-06-01))]);
        assert!(split_windows(day, day - time::Duration::days(2), 31).is_empty());
    }

    #[test]
    fn statuses_map_onto_fetch_errors() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(120))),
            FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(120))
            }
        );
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None),
            FetchError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None),
            FetchError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None),
            FetchError::Transport(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None),
            FetchError::Transport(_)
        ));
    }

    #[test]
    fn latest_payload_keeps_only_accumulating_counters() {
        let latest: LatestDto = serde_json::from_str(
            r#"{"meterCounters": [
                {"meterCounterId": "a", "counterType": "ElectricityFromGrid", "readingType": "consumption", "isPrimary": true, "unit": "kWh"},
                {"meterCounterId": "b", "counterType": "ElectricityToGrid", "isPrimary": false},
                {"meterCounterId": "c", "counterType": "SupplyTemp", "unit": "°C"},
                {"counterType": "Heat"}
            ]}"#,
        )
        .unwrap();
        let counters: Vec<Counter> = latest
            .meter_counters
            .into_iter()
            .filter_map(CounterDto::into_counter)
            .collect();

        assert_eq!(counters.len(), 2);
        assert_eq!(counters[0].reading_kind, ReadingKind::Consumption);
        assert_eq!(counters[1].reading_kind, ReadingKind::Counter);
        assert_eq!(counters[1].unit, "kWh");
        assert_eq!(counters[1].suffix(), "secondary");
    }

    #[test]
    fn historical_payload_parses_readings() {
        let dto: HistoricalDto = serde_json::from_str(
            r#"{"readings": [{"meterCounterId": "a", "timestamp": "2024-05-01T01:00:00Z", "value": "12.5"}]}"#,
        )
        .unwrap();
        assert_eq!(dto.readings.len(), 1);
        assert_eq!(dto.readings[0].meter_counter_id.as_deref(), Some("a"));
    }

    #[test]
    fn installation_label_includes_nickname_when_present() {
        let mut installation = Installation {
            installation_id: "42".to_string(),
            installation_type: "Electricity".to_string(),
            address: Some("Main street 1".to_string()),
            meter_serial: Some("SN-9".to_string()),
            utility_name: None,
            nickname: None,
        };
        assert_eq!(installation.label(), "Main street 1 - SN-9");
        installation.nickname = Some("Garage".to_string());
        assert_eq!(installation.label(), "Main street 1 - SN-9 (Garage)");
    }

    #[test]
    fn request_dates_are_zero_padded() {
        assert_eq!(iso_date(date!(2024-03-05)), "2024-03-05");
    }
}
