//! Which statistics exist, and which account and meter each belongs to.

use std::{collections::BTreeMap, sync::Arc};

use meterportal_client::domain::{
    meter_reading_sensor_name, Counter, CounterType, Meter, MeterType, StatisticId,
};
use serde::Serialize;
use tokio::sync::RwLock;

pub const DEFAULT_STATISTIC_PREFIX: &str = "meterportal";

#[derive(Debug, Clone, PartialEq)]
pub struct CumulativeStatistic {
    pub id: StatisticId,
    pub counter: Counter,
    /// Raw meter-reading sensor published next to the statistic.
    pub sensor_name: String,
}

/// Import minus export of one electricity meter. `import` and `export`
/// index into the plan's cumulative statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct NetStatistic {
    pub id: StatisticId,
    pub import: usize,
    pub export: usize,
}

/// Everything the engine derives from one meter.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterPlan {
    pub account_id: String,
    pub meter: Meter,
    pub cumulative: Vec<CumulativeStatistic>,
    pub net: Option<NetStatistic>,
}

impl MeterPlan {
    pub fn build(prefix: &str, account_id: &str, meter: Meter) -> Self {
        let cumulative: Vec<CumulativeStatistic> = meter
            .counters
            .iter()
            .map(|counter| CumulativeStatistic {
                id: StatisticId::cumulative(prefix, &meter.meter_id, counter),
                counter: counter.clone(),
                sensor_name: meter_reading_sensor_name(&meter.meter_id, counter),
            })
            .collect();

        let net = if meter.meter_type() == Some(MeterType::Electricity) {
            let import = pick(&cumulative, CounterType::ElectricityFromGrid);
            let export = pick(&cumulative, CounterType::ElectricityToGrid);
            import.zip(export).map(|(import, export)| NetStatistic {
                id: StatisticId::net_consumption(prefix, &meter.meter_id),
                import,
                export,
            })
        } else {
            None
        };

        Self {
            account_id: account_id.to_string(),
            meter,
            cumulative,
            net,
        }
    }

    pub fn meter_id(&self) -> &str {
        &self.meter.meter_id
    }

    pub fn statistic_ids(&self) -> impl Iterator<Item = &StatisticId> {
        self.cumulative
            .iter()
            .map(|s| &s.id)
            .chain(self.net.as_ref().map(|n| &n.id))
    }

    /// Cumulative statistics to re-import when `id` is backfilled.
    pub fn targets_for(&self, id: &StatisticId) -> Option<Vec<usize>> {
        if let Some(idx) = self.cumulative.iter().position(|s| &s.id == id) {
            return Some(vec![idx]);
        }
        match &self.net {
            Some(net) if &net.id == id => Some(vec![net.import, net.export]),
            _ => None,
        }
    }
}

/// Primary counter of the given type, else the first one.
fn pick(stats: &[CumulativeStatistic], counter_type: CounterType) -> Option<usize> {
    let matching = || {
        stats
            .iter()
            .enumerate()
            .filter(move |(_, s)| s.counter.counter_type == counter_type)
    };
    matching()
        .find(|(_, s)| s.counter.is_primary)
        .or_else(|| matching().next())
        .map(|(i, _)| i)
}

/// A statistic located in the registry.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub plan: MeterPlan,
    pub targets: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatisticListing {
    pub statistic_id: String,
    pub meter_id: String,
    pub kind: &'static str,
    pub unit: String,
    pub sensor_name: Option<String>,
}

pub struct Registry {
    prefix: String,
    accounts: RwLock<BTreeMap<String, Arc<Vec<MeterPlan>>>>,
}

impl Registry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            accounts: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Replace the meters known for an account.
    pub async fn install(&self, account_id: &str, meters: Vec<Meter>) -> Arc<Vec<MeterPlan>> {
        let plans: Arc<Vec<MeterPlan>> = Arc::new(
            meters
                .into_iter()
                .map(|m| MeterPlan::build(&self.prefix, account_id, m))
                .collect(),
        );
        tracing::info!(
            account_id,
            meters = plans.len(),
            statistics = plans.iter().map(|p| p.statistic_ids().count()).sum::<usize>(),
            "registered account meters"
        );
        self.accounts
            .write()
            .await
            .insert(account_id.to_string(), plans.clone());
        plans
    }

    pub async fn plans(&self, account_id: &str) -> Option<Arc<Vec<MeterPlan>>> {
        self.accounts.read().await.get(account_id).cloned()
    }

    pub async fn resolve(&self, statistic_id: &StatisticId) -> Option<Resolved> {
        let accounts = self.accounts.read().await;
        accounts.values().flat_map(|plans| plans.iter()).find_map(|plan| {
            plan.targets_for(statistic_id).map(|targets| Resolved {
                plan: plan.clone(),
                targets,
            })
        })
    }

    pub async fn listing(&self, account_id: &str) -> Vec<StatisticListing> {
        let Some(plans) = self.plans(account_id).await else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for plan in plans.iter() {
            for stat in &plan.cumulative {
                out.push(StatisticListing {
                    statistic_id: stat.id.to_string(),
                    meter_id: plan.meter_id().to_string(),
                    kind: "cumulative",
                    unit: stat.counter.unit.clone(),
                    sensor_name: Some(stat.sensor_name.clone()),
                });
            }
            if let Some(net) = &plan.net {
                out.push(StatisticListing {
                    statistic_id: net.id.to_string(),
                    meter_id: plan.meter_id().to_string(),
                    kind: "net",
                    unit: plan.cumulative[net.import].counter.unit.clone(),
                    sensor_name: None,
                });
            }
        }
        out
    }
}
