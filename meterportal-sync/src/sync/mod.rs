//! Fetch, reconcile, write and advance, one meter at a time.
//!
//! Every fetched page is applied as a unit: all statistics touched by the
//! page are written in one sink call, and only after the sink acknowledges
//! do their watermarks move. A failed page leaves every watermark where it
//! was, so the same range can be fetched again safely.

pub mod locks;

use std::{collections::BTreeMap, sync::Arc};

use futures::StreamExt;
use meterportal_client::domain::{Counter, StatisticId, StatisticPoint};
use serde::Serialize;
use time::{Duration, OffsetDateTime};

pub use locks::{MeterGuard, MeterLocks};

use crate::{
    clock::Clock,
    pipeline::{
        Credentials, ReadingPage, ReadingSource, StatisticBatch, StatisticsSink, SyncError,
    },
    reconcile::{net::net_consumption, Anomaly, ReconcileSettings, ReconciledBatch, Reconciler},
    registry::MeterPlan,
    state::StateStore,
    transform,
};

pub const DEFAULT_INITIAL_HISTORY_DAYS: u32 = 30;

/// Counter readings are booked an hour before their timestamp, so stored
/// points are loaded from a day before the fetch range.
const LOAD_MARGIN: Duration = Duration::DAY;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    pub reconcile: ReconcileSettings,
    pub initial_history_days: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            reconcile: ReconcileSettings::default(),
            initial_history_days: DEFAULT_INITIAL_HISTORY_DAYS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Append after the watermark.
    Incremental,
    /// Re-import a window over what is stored.
    Override,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub pages: usize,
    pub points_written: usize,
    pub anomalies: usize,
    pub quarantined: usize,
    pub discarded: usize,
}

impl SyncReport {
    fn absorb(&mut self, other: SyncReport) {
        self.pages += other.pages;
        self.points_written += other.points_written;
        self.anomalies += other.anomalies;
        self.quarantined += other.quarantined;
        self.discarded += other.discarded;
    }
}

/// One statistic as seen by a run, kept current with what the run writes.
struct Series {
    id: StatisticId,
    watermark: Option<OffsetDateTime>,
    before: Option<StatisticPoint>,
    points: BTreeMap<OffsetDateTime, StatisticPoint>,
}

impl Series {
    async fn load(
        sink: &dyn StatisticsSink,
        state: &dyn StateStore,
        id: &StatisticId,
        from: OffsetDateTime,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            id: id.clone(),
            watermark: state.watermark(id).await?,
            before: sink.last_point_before(id, from).await?,
            points: sink
                .points_since(id, from)
                .await?
                .into_iter()
                .map(|p| (p.ts, p))
                .collect(),
        })
    }

    fn last(&self) -> Option<StatisticPoint> {
        self.points.values().next_back().copied().or(self.before)
    }

    fn baseline(&self, first: OffsetDateTime) -> Option<StatisticPoint> {
        self.points
            .range(..first)
            .next_back()
            .map(|(_, p)| *p)
            .or(self.before.filter(|b| b.ts < first))
    }

    fn since(&self, first: OffsetDateTime) -> Vec<StatisticPoint> {
        self.points.range(first..).map(|(_, p)| *p).collect()
    }

    /// Stored points from `first` on with `pending` laid over them.
    fn preview(&self, first: OffsetDateTime, pending: &[StatisticPoint]) -> Vec<StatisticPoint> {
        let mut view: BTreeMap<OffsetDateTime, StatisticPoint> =
            self.points.range(first..).map(|(ts, p)| (*ts, *p)).collect();
        for p in pending.iter().filter(|p| p.ts >= first) {
            view.insert(p.ts, *p);
        }
        view.into_values().collect()
    }

    fn apply(&mut self, points: &[StatisticPoint]) {
        for p in points {
            self.points.insert(p.ts, *p);
        }
    }
}

pub struct SyncEngine {
    source: Arc<dyn ReadingSource>,
    sink: Arc<dyn StatisticsSink>,
    state: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    reconciler: Reconciler,
    initial_history: Duration,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn ReadingSource>,
        sink: Arc<dyn StatisticsSink>,
        state: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            source,
            sink,
            state,
            clock,
            reconciler: Reconciler::new(settings.reconcile),
            initial_history: Duration::days(i64::from(settings.initial_history_days)),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Import everything newer than each statistic's watermark, up to now.
    ///
    /// Statistics with no watermark and no stored points start
    /// `initial_history_days` back. The caller must hold the meter's lock.
    pub async fn poll_meter(
        &self,
        _guard: &MeterGuard,
        credentials: &Credentials,
        plan: &MeterPlan,
    ) -> Result<SyncReport, SyncError> {
        let now = self.clock.now();
        let seed_from = now - self.initial_history;

        let mut resume: Option<OffsetDateTime> = None;
        for stat in &plan.cumulative {
            let watermark = self.state.watermark(&stat.id).await?;
            let last = self.sink.last_point(&stat.id).await?.map(|p| p.ts);
            let from = watermark.max(last).unwrap_or(seed_from);
            resume = Some(resume.map_or(from, |r| r.min(from)));
        }
        let Some(from) = resume else {
            return Ok(SyncReport::default());
        };

        let targets: Vec<usize> = (0..plan.cumulative.len()).collect();
        self.run(credentials, plan, &targets, Mode::Incremental, from, now)
            .await
    }

    /// Re-import `[from, to]` for the given statistics of the plan, merging
    /// with what is stored and recomputing sums from the window onwards.
    /// The caller must hold the meter's lock.
    pub async fn backfill_meter(
        &self,
        _guard: &MeterGuard,
        credentials: &Credentials,
        plan: &MeterPlan,
        targets: &[usize],
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<SyncReport, SyncError> {
        self.run(credentials, plan, targets, Mode::Override, from, to)
            .await
    }

    async fn run(
        &self,
        credentials: &Credentials,
        plan: &MeterPlan,
        targets: &[usize],
        mode: Mode,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<SyncReport, SyncError> {
        let load_from = from - LOAD_MARGIN;
        let mut series = Vec::with_capacity(plan.cumulative.len());
        for stat in &plan.cumulative {
            series.push(Series::load(&*self.sink, &*self.state, &stat.id, load_from).await?);
        }
        let counters: Vec<&Counter> = plan.cumulative.iter().map(|s| &s.counter).collect();

        tracing::debug!(
            meter_id = plan.meter_id(),
            mode = ?mode,
            from = %from,
            to = %to,
            "fetching readings"
        );

        let mut report = SyncReport::default();
        let mut pages = self.source.fetch(credentials, plan.meter_id(), from, to);
        while let Some(page) = pages.next().await {
            let page = page?;
            let page_report = self
                .apply_page(plan, targets, mode, &mut series, &counters, page)
                .await?;
            report.absorb(page_report);
        }
        Ok(report)
    }

    async fn apply_page(
        &self,
        plan: &MeterPlan,
        targets: &[usize],
        mode: Mode,
        series: &mut [Series],
        counters: &[&Counter],
        page: ReadingPage,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport {
            pages: 1,
            ..SyncReport::default()
        };
        let mut parts = transform::partition_by_counter(page.readings, counters);
        report.quarantined = parts.quarantined;

        let mut folded: Vec<(usize, ReconciledBatch)> = Vec::with_capacity(targets.len());
        for &idx in targets {
            let stat = &plan.cumulative[idx];
            let kind = stat.counter.reading_kind;
            let prepared = self
                .reconciler
                .prepare(kind, parts.take(&stat.counter.counter_id));
            let current = &series[idx];

            let batch = match mode {
                Mode::Incremental => self.reconciler.fold_incremental(
                    kind,
                    prepared,
                    current.watermark,
                    current.last().as_ref(),
                ),
                Mode::Override => match prepared.first_start() {
                    Some(first) => self.reconciler.fold_override(
                        kind,
                        prepared,
                        current.baseline(first).as_ref(),
                        &current.since(first),
                    ),
                    None => ReconciledBatch {
                        anomalies: prepared.anomalies,
                        ..ReconciledBatch::default()
                    },
                },
            };

            self.record_anomalies(&stat.id, &batch.anomalies);
            report.anomalies += batch.anomalies.len();
            report.discarded += batch.discarded;
            folded.push((idx, batch));
        }

        let mut writes: Vec<StatisticBatch> = folded
            .iter()
            .filter(|(_, batch)| !batch.points.is_empty())
            .map(|(idx, batch)| (plan.cumulative[*idx].id.clone(), batch.points.clone()))
            .collect();

        let net = net_points(plan, series, &folded);
        if let Some((net_id, points)) = &net {
            if !points.is_empty() {
                writes.push((net_id.clone(), points.clone()));
            }
        }

        if !writes.is_empty() {
            self.sink.write_many(&writes).await?;
        }
        report.points_written = writes.iter().map(|(_, points)| points.len()).sum();

        for (idx, batch) in &folded {
            let current = &mut series[*idx];
            current.apply(&batch.points);
            if let Some(to) = batch.advance_to {
                self.state.advance(&current.id, to).await?;
                current.watermark = current.watermark.max(Some(to));
            }
        }
        if let Some((net_id, points)) = &net {
            if let Some(last) = points.last() {
                self.state.advance(net_id, last.ts).await?;
            }
        }

        if report.points_written > 0 || report.quarantined > 0 || report.anomalies > 0 {
            tracing::info!(
                meter_id = plan.meter_id(),
                from = %page.from,
                to = %page.to,
                points = report.points_written,
                anomalies = report.anomalies,
                quarantined = report.quarantined,
                "applied reading page"
            );
        } else {
            tracing::debug!(
                meter_id = plan.meter_id(),
                from = %page.from,
                to = %page.to,
                discarded = report.discarded,
                "reading page had nothing new"
            );
        }

        Ok(report)
    }

    fn record_anomalies(&self, statistic_id: &StatisticId, anomalies: &[Anomaly]) {
        let policy = self.reconciler.settings().anomaly_policy;
        for anomaly in anomalies {
            metrics::counter!("reconcile_anomalies_total", "kind" => anomaly.kind()).increment(1);
            match anomaly {
                Anomaly::NegativeDelta { ts, delta } => tracing::warn!(
                    statistic_id = %statistic_id,
                    ts = %ts,
                    delta,
                    policy = ?policy,
                    "meter value went backwards"
                ),
                Anomaly::OutOfOrder { ts } => tracing::warn!(
                    statistic_id = %statistic_id,
                    ts = %ts,
                    "vendor returned readings out of order"
                ),
            }
        }
    }
}

fn pending_for(folded: &[(usize, ReconciledBatch)], idx: usize) -> &[StatisticPoint] {
    folded
        .iter()
        .find(|(i, _)| *i == idx)
        .map(|(_, batch)| batch.points.as_slice())
        .unwrap_or(&[])
}

/// Net points for every hour from the earliest import or export change on.
fn net_points(
    plan: &MeterPlan,
    series: &[Series],
    folded: &[(usize, ReconciledBatch)],
) -> Option<(StatisticId, Vec<StatisticPoint>)> {
    let net = plan.net.as_ref()?;
    let import_pending = pending_for(folded, net.import);
    let export_pending = pending_for(folded, net.export);
    let first = import_pending
        .iter()
        .chain(export_pending)
        .map(|p| p.ts)
        .min()?;

    let import = series[net.import].preview(first, import_pending);
    let export = series[net.export].preview(first, export_pending);
    Some((net.id.clone(), net_consumption(&import, &export)))
}
