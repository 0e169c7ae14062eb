//! Turns vendor readings into cumulative statistic points.
//!
//! A batch goes through two steps. [`Reconciler::prepare`] orders the
//! readings of one counter, collapses duplicate timestamps (last write wins)
//! and buckets them onto hourly statistic starts. One of the fold functions
//! then computes deltas against the previous known state and accumulates the
//! running sum:
//!
//! - [`Reconciler::fold_incremental`] appends after the watermark and is what
//!   periodic polling uses.
//! - [`Reconciler::fold_override`] re-imports a window that may overlap points
//!   already stored, merging by timestamp and recomputing every stored point
//!   from the first fetched hour onwards.
//!
//! The running sum never decreases. A negative delta beyond the configured
//! tolerance is an anomaly: it is recorded and handled by [`AnomalyPolicy`],
//! and it never aborts the rest of the batch.

use std::collections::{BTreeMap, BTreeSet};

use meterportal_client::domain::{Reading, ReadingKind, StatisticPoint};
use serde::Deserialize;
use time::{Duration, OffsetDateTime, UtcOffset};

pub mod net;

pub const DEFAULT_NEGATIVE_DELTA_TOLERANCE: f64 = 0.001;

const POINT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyPolicy {
    /// Keep the reading, count a zero delta, continue from the new raw value.
    /// Survives meter rollovers and replacements.
    #[default]
    Clamp,
    /// Drop the reading and keep measuring from the previous state.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileSettings {
    pub negative_delta_tolerance: f64,
    pub anomaly_policy: AnomalyPolicy,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            negative_delta_tolerance: DEFAULT_NEGATIVE_DELTA_TOLERANCE,
            anomaly_policy: AnomalyPolicy::Clamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Anomaly {
    NegativeDelta { ts: OffsetDateTime, delta: f64 },
    OutOfOrder { ts: OffsetDateTime },
}

impl Anomaly {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NegativeDelta { .. } => "negative_delta",
            Self::OutOfOrder { .. } => "out_of_order",
        }
    }
}

/// Readings of one counter keyed by statistic start, oldest first.
#[derive(Debug, Clone, Default)]
pub struct Prepared {
    samples: Vec<(OffsetDateTime, f64)>,
    pub anomalies: Vec<Anomaly>,
    pub duplicates: usize,
}

impl Prepared {
    pub fn first_start(&self) -> Option<OffsetDateTime> {
        self.samples.first().map(|(ts, _)| *ts)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconciledBatch {
    /// Points for the sink, oldest first.
    pub points: Vec<StatisticPoint>,
    /// Where the watermark goes once the sink has acknowledged `points`.
    pub advance_to: Option<OffsetDateTime>,
    pub anomalies: Vec<Anomaly>,
    /// Samples dropped because they were at or before the watermark.
    pub discarded: usize,
}

/// Start of the hourly statistic a reading belongs to.
///
/// A cumulative counter reading closes the hour before it, so it is booked
/// one hour earlier than its truncated timestamp. Interval consumption is
/// booked on its own hour.
pub fn statistic_start(ts: OffsetDateTime, kind: ReadingKind) -> OffsetDateTime {
    let utc = ts.to_offset(UtcOffset::UTC);
    let into_hour = Duration::minutes(i64::from(utc.minute()))
        + Duration::seconds(i64::from(utc.second()))
        + Duration::nanoseconds(i64::from(utc.nanosecond()));
    let hour = utc - into_hour;
    match kind {
        ReadingKind::Counter => hour - Duration::HOUR,
        ReadingKind::Consumption => hour,
    }
}

#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(settings: ReconcileSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    /// Order, deduplicate and bucket the readings of one counter.
    pub fn prepare(&self, kind: ReadingKind, readings: Vec<Reading>) -> Prepared {
        let mut anomalies = Vec::new();
        let mut latest: Option<OffsetDateTime> = None;
        for r in &readings {
            match latest {
                Some(prev) if r.ts < prev => anomalies.push(Anomaly::OutOfOrder { ts: r.ts }),
                _ => latest = Some(r.ts),
            }
        }

        // Vendor order decides which of two equal timestamps wins.
        let mut by_ts: BTreeMap<OffsetDateTime, f64> = BTreeMap::new();
        let mut duplicates = 0;
        for r in readings {
            if by_ts.insert(r.ts, r.value).is_some() {
                duplicates += 1;
            }
        }

        let mut buckets: BTreeMap<OffsetDateTime, f64> = BTreeMap::new();
        for (ts, value) in by_ts {
            let start = statistic_start(ts, kind);
            match kind {
                ReadingKind::Counter => {
                    buckets.insert(start, value);
                }
                ReadingKind::Consumption => {
                    *buckets.entry(start).or_insert(0.0) += value;
                }
            }
        }

        Prepared {
            samples: buckets.into_iter().collect(),
            anomalies,
            duplicates,
        }
    }

    /// Append samples newer than both the watermark and the last stored point.
    pub fn fold_incremental(
        &self,
        kind: ReadingKind,
        prepared: Prepared,
        watermark: Option<OffsetDateTime>,
        last: Option<&StatisticPoint>,
    ) -> ReconciledBatch {
        let cutoff = match (watermark, last.map(|p| p.ts)) {
            (Some(w), Some(l)) => Some(w.max(l)),
            (w, l) => w.or(l),
        };

        let total = prepared.samples.len();
        let fresh: Vec<(OffsetDateTime, f64)> = prepared
            .samples
            .into_iter()
            .filter(|(ts, _)| cutoff.map_or(true, |c| *ts > c))
            .collect();
        let discarded = total - fresh.len();

        let mut anomalies = prepared.anomalies;
        let points = self.fold(kind, &fresh, last, &BTreeSet::new(), &mut anomalies);

        ReconciledBatch {
            advance_to: points.last().map(|p| p.ts),
            points,
            anomalies,
            discarded,
        }
    }

    /// Merge samples into the stored series and recompute it from the first
    /// sample onwards.
    ///
    /// `baseline` is the last stored point before the first sample and
    /// `stored` the stored points from the first sample on. Samples replace
    /// stored states at equal timestamps. Only points that differ from what
    /// is stored are returned for writing.
    pub fn fold_override(
        &self,
        kind: ReadingKind,
        prepared: Prepared,
        baseline: Option<&StatisticPoint>,
        stored: &[StatisticPoint],
    ) -> ReconciledBatch {
        let mut anomalies = prepared.anomalies;
        let Some(first) = prepared.samples.first().map(|(ts, _)| *ts) else {
            return ReconciledBatch {
                anomalies,
                ..ReconciledBatch::default()
            };
        };

        let stored: BTreeMap<OffsetDateTime, StatisticPoint> = stored
            .iter()
            .filter(|p| p.ts >= first)
            .map(|p| (p.ts, *p))
            .collect();

        let mut merged: BTreeMap<OffsetDateTime, f64> =
            stored.values().map(|p| (p.ts, p.state)).collect();
        for (ts, value) in prepared.samples {
            merged.insert(ts, value);
        }
        let samples: Vec<(OffsetDateTime, f64)> = merged.into_iter().collect();

        let baseline = baseline.filter(|b| b.ts < first);
        let pinned: BTreeSet<OffsetDateTime> = stored.keys().copied().collect();
        let recomputed = self.fold(kind, &samples, baseline, &pinned, &mut anomalies);

        let advance_to = recomputed.last().map(|p| p.ts);
        let points = recomputed
            .into_iter()
            .filter(|p| stored.get(&p.ts).map_or(true, |s| !same_point(s, p)))
            .collect();

        ReconciledBatch {
            points,
            advance_to,
            anomalies,
            discarded: 0,
        }
    }

    /// Accumulate samples on top of `baseline`.
    ///
    /// Timestamps in `pinned` already exist in the store and must be
    /// re-emitted even when skipped, otherwise a stale row would break the
    /// non-decreasing sum.
    fn fold(
        &self,
        kind: ReadingKind,
        samples: &[(OffsetDateTime, f64)],
        baseline: Option<&StatisticPoint>,
        pinned: &BTreeSet<OffsetDateTime>,
        anomalies: &mut Vec<Anomaly>,
    ) -> Vec<StatisticPoint> {
        let mut points = Vec::with_capacity(samples.len());
        let mut prev_state = baseline.map(|p| p.state);
        let mut sum = baseline.map_or(0.0, |p| p.sum);

        for &(ts, value) in samples {
            let raw_delta = match kind {
                ReadingKind::Counter => prev_state.map_or(0.0, |prev| value - prev),
                ReadingKind::Consumption => value,
            };

            let delta = if raw_delta < -self.settings.negative_delta_tolerance {
                anomalies.push(Anomaly::NegativeDelta { ts, delta: raw_delta });
                match self.settings.anomaly_policy {
                    AnomalyPolicy::Clamp => 0.0,
                    AnomalyPolicy::Skip => {
                        if pinned.contains(&ts) {
                            let state = match kind {
                                ReadingKind::Counter => prev_state.unwrap_or(value),
                                ReadingKind::Consumption => 0.0,
                            };
                            points.push(StatisticPoint { ts, state, sum });
                        }
                        continue;
                    }
                }
            } else {
                raw_delta.max(0.0)
            };

            sum += delta;
            points.push(StatisticPoint {
                ts,
                state: value,
                sum,
            });
            prev_state = Some(value);
        }

        points
    }
}

fn same_point(a: &StatisticPoint, b: &StatisticPoint) -> bool {
    a.ts == b.ts && (a.state - b.state).abs() < POINT_EPSILON && (a.sum - b.sum).abs() < POINT_EPSILON
}
