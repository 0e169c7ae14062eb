use serde::Deserialize;
use std::{collections::HashSet, fs, path::PathBuf, time::Duration};

use anyhow::Context;

use crate::{
    reconcile::{AnomalyPolicy, ReconcileSettings, DEFAULT_NEGATIVE_DELTA_TOLERANCE},
    registry::DEFAULT_STATISTIC_PREFIX,
    scheduler::DEFAULT_RATE_LIMIT_COOLDOWN,
    sources::meterportal::{DEFAULT_BASE_URL, DEFAULT_MAX_WINDOW_DAYS},
    state::{IntervalOutOfRange, PollConfig},
    sync::{EngineSettings, DEFAULT_INITIAL_HISTORY_DAYS},
};

#[derive(Debug, Clone, Deserialize)]
pub struct QuestDbConfig {
    pub uri: String,
    pub max_connections: u32,
    /// Create the statistics table on startup when missing.
    #[serde(default = "default_true")]
    pub create_schema: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VendorConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub max_window_days: u32,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_secs: 60,
            max_window_days: DEFAULT_MAX_WINDOW_DAYS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub initial_history_days: u32,
    pub rate_limit_cooldown_secs: u64,
    pub negative_delta_tolerance: f64,
    pub anomaly_policy: AnomalyPolicy,
    pub statistic_prefix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_history_days: DEFAULT_INITIAL_HISTORY_DAYS,
            rate_limit_cooldown_secs: DEFAULT_RATE_LIMIT_COOLDOWN.as_secs(),
            negative_delta_tolerance: DEFAULT_NEGATIVE_DELTA_TOLERANCE,
            anomaly_policy: AnomalyPolicy::default(),
            statistic_prefix: DEFAULT_STATISTIC_PREFIX.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            reconcile: ReconcileSettings {
                negative_delta_tolerance: self.negative_delta_tolerance,
                anomaly_policy: self.anomaly_policy,
            },
            initial_history_days: self.initial_history_days,
        }
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
    /// Scrape path.
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

#[derive(Clone, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    pub api_key: String,
    #[serde(default = "default_update_interval")]
    pub update_interval_minutes: u32,
    /// Only these installation ids are synced when set.
    #[serde(default)]
    pub installations: Option<Vec<String>>,
}

impl AccountConfig {
    pub fn poll_config(&self) -> Result<PollConfig, IntervalOutOfRange> {
        PollConfig::new(self.update_interval_minutes)
    }
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("update_interval_minutes", &self.update_interval_minutes)
            .field("installations", &self.installations)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub questdb: QuestDbConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub vendor: VendorConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    pub state: StateConfig,
    pub api: ApiConfig,
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("METERPORTAL_CONFIG").unwrap_or_else(|_| "meterportal-sync.toml".to_string());
        let contents = fs::read_to_string(&path).with_context(|| format!("reading config {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("loading config {path}"))
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.id.as_str()) {
                anyhow::bail!("duplicate account id {}", account.id);
            }
            if account.api_key.trim().is_empty() {
                anyhow::bail!("account {} has an empty api_key", account.id);
            }
            account
                .poll_config()
                .with_context(|| format!("account {}", account.id))?;
        }
        if self.vendor.max_window_days == 0 || self.vendor.max_window_days > DEFAULT_MAX_WINDOW_DAYS {
            anyhow::bail!(
                "vendor.max_window_days must be within 1..={DEFAULT_MAX_WINDOW_DAYS}, got {}",
                self.vendor.max_window_days
            );
        }
        let tolerance = self.sync.negative_delta_tolerance;
        if tolerance.is_nan() || tolerance < 0.0 {
            anyhow::bail!("sync.negative_delta_tolerance must not be negative");
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_update_interval() -> u32 {
    PollConfig::DEFAULT_MINUTES
}
