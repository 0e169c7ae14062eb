use std::cmp::Ordering;

use meterportal_client::domain::StatisticPoint;

/// Net grid consumption from the import and export cumulative series.
///
/// Only hours present in both series produce a point. The value is
/// `max(0, import_sum - export_sum)` and is used for both state and sum.
/// Both inputs must be ordered by timestamp.
pub fn net_consumption(import: &[StatisticPoint], export: &[StatisticPoint]) -> Vec<StatisticPoint> {
    let mut out = Vec::with_capacity(import.len().min(export.len()));
    let (mut i, mut j) = (0, 0);

    while i < import.len() && j < export.len() {
        match import[i].ts.cmp(&export[j].ts) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                let net = (import[i].sum - export[j].sum).max(0.0);
                out.push(StatisticPoint {
                    ts: import[i].ts,
                    state: net,
                    sum: net,
                });
                i += 1;
                j += 1;
            }
        }
    }

    out
}
