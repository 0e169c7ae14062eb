//! Periodic polling. Each account runs its own task; accounts share nothing
//! but the engine and the registry.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use meterportal_client::domain::Meter;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::{
    sync::{watch, Notify},
    task::JoinSet,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    pipeline::{Credentials, FetchError, MeterDiscovery, SyncError},
    registry::Registry,
    state::{PollConfig, PollConfigStore},
    sync::{MeterLocks, SyncEngine, SyncReport},
};

pub const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AccountState {
    Idle,
    Polling,
    CoolingDown {
        #[serde(with = "time::serde::rfc3339")]
        until: OffsetDateTime,
    },
    Suspended {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountStatus {
    #[serde(flatten)]
    pub state: AccountState,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub in_flight: usize,
}

impl Default for AccountStatus {
    fn default() -> Self {
        Self {
            state: AccountState::Idle,
            last_success: None,
            last_error: None,
            in_flight: 0,
        }
    }
}

/// Meters a pending refresh covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshScope {
    All,
    Installations(BTreeSet<String>),
}

impl RefreshScope {
    fn merge(self, other: RefreshScope) -> RefreshScope {
        match (self, other) {
            (RefreshScope::Installations(mut a), RefreshScope::Installations(b)) => {
                a.extend(b);
                RefreshScope::Installations(a)
            }
            _ => RefreshScope::All,
        }
    }

    pub fn includes(&self, meter_id: &str) -> bool {
        match self {
            RefreshScope::All => true,
            RefreshScope::Installations(ids) => ids.contains(meter_id),
        }
    }
}

impl AccountStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(
            self.state,
            AccountState::CoolingDown { .. } | AccountState::Suspended { .. }
        ) || self.last_error.is_some()
    }
}

/// Live handle on one account: its credentials, poll settings, status and
/// meter locks.
pub struct AccountHandle {
    id: String,
    email: Option<String>,
    allowlist: Option<Vec<String>>,
    credentials: watch::Sender<Credentials>,
    poll: watch::Sender<PollConfig>,
    status: watch::Sender<AccountStatus>,
    locks: MeterLocks,
    refresh: Notify,
    pending_refresh: Mutex<Option<RefreshScope>>,
}

impl AccountHandle {
    pub fn new(
        id: impl Into<String>,
        email: Option<String>,
        credentials: Credentials,
        poll: PollConfig,
        allowlist: Option<Vec<String>>,
    ) -> Self {
        let (credentials, _) = watch::channel(credentials);
        let (poll, _) = watch::channel(poll);
        let (status, _) = watch::channel(AccountStatus::default());
        Self {
            id: id.into(),
            email,
            allowlist,
            credentials,
            poll,
            status,
            locks: MeterLocks::new(),
            refresh: Notify::new(),
            pending_refresh: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn allowlist(&self) -> Option<&[String]> {
        self.allowlist.as_deref()
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials.borrow().clone()
    }

    /// Swap the API key. A suspended account resumes polling right away.
    pub fn replace_credentials(&self, credentials: Credentials) {
        self.credentials.send_replace(credentials);
    }

    pub fn poll_config(&self) -> PollConfig {
        *self.poll.borrow()
    }

    /// Takes effect when the next interval is scheduled; a running cycle is
    /// not affected.
    pub fn update_poll(&self, config: PollConfig) {
        self.poll.send_replace(config);
    }

    /// Validate, persist and apply a new update interval.
    pub async fn set_update_interval(
        &self,
        store: &dyn PollConfigStore,
        minutes: u32,
    ) -> Result<PollConfig, SyncError> {
        let config = PollConfig::new(minutes)?;
        store.set_poll_config(&self.id, config).await?;
        self.update_poll(config);
        tracing::info!(account_id = %self.id, minutes, "update interval changed");
        Ok(config)
    }

    pub fn status(&self) -> AccountStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<AccountStatus> {
        self.status.subscribe()
    }

    pub fn locks(&self) -> &MeterLocks {
        &self.locks
    }

    /// Ask the account task for an immediate poll of one installation, or of
    /// every meter when `installation_id` is `None`. Requests made while a
    /// refresh is pending are merged into it.
    pub fn request_refresh(&self, installation_id: Option<&str>) {
        let scope = match installation_id {
            Some(id) => RefreshScope::Installations(BTreeSet::from([id.to_string()])),
            None => RefreshScope::All,
        };
        let mut pending = self
            .pending_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *pending = Some(match pending.take() {
            Some(earlier) => earlier.merge(scope),
            None => scope,
        });
        drop(pending);
        self.refresh.notify_one();
    }

    fn take_refresh(&self) -> Option<RefreshScope> {
        self.pending_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn set_state(&self, state: AccountState) {
        self.status.send_modify(|s| s.state = state);
    }
}

/// Every configured account, keyed by id.
#[derive(Default)]
pub struct AccountSet {
    accounts: BTreeMap<String, Arc<AccountHandle>>,
}

impl AccountSet {
    pub fn new(handles: impl IntoIterator<Item = AccountHandle>) -> Self {
        Self {
            accounts: handles
                .into_iter()
                .map(|h| (h.id.clone(), Arc::new(h)))
                .collect(),
        }
    }

    pub fn get(&self, account_id: &str) -> Option<&Arc<AccountHandle>> {
        self.accounts.get(account_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AccountHandle>> {
        self.accounts.values()
    }
}

/// Wake up `installation_id`'s account, or every account when `None`.
///
/// Accounts are matched on their discovered meters. When none owns the
/// installation, accounts that have not discovered their meters yet are
/// woken instead. Returns the ids of the accounts asked to refresh.
pub async fn refresh_accounts(
    accounts: &AccountSet,
    registry: &Registry,
    installation_id: Option<&str>,
) -> Vec<String> {
    let Some(installation_id) = installation_id else {
        for account in accounts.iter() {
            account.request_refresh(None);
        }
        return accounts.iter().map(|a| a.id.clone()).collect();
    };

    let mut owners = Vec::new();
    let mut undiscovered = Vec::new();
    for account in accounts.iter() {
        match registry.plans(&account.id).await {
            Some(plans) if plans.iter().any(|p| p.meter_id() == installation_id) => owners.push(account),
            Some(plans) if !plans.is_empty() => {}
            _ => undiscovered.push(account),
        }
    }
    let targets = if owners.is_empty() { undiscovered } else { owners };
    for account in &targets {
        account.request_refresh(Some(installation_id));
    }
    targets.iter().map(|a| a.id.clone()).collect()
}

/// When the account task polls next, and the earliest it may after a rate
/// limit.
struct Schedule {
    next_tick: Instant,
    not_before: Instant,
}

impl Schedule {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            next_tick: now,
            not_before: now,
        }
    }

    /// Poll as soon as the cooldown allows.
    fn wake(&mut self) {
        self.next_tick = Instant::now().max(self.not_before);
    }

    fn after(&mut self, interval: Duration) {
        self.next_tick = (Instant::now() + interval).max(self.not_before);
    }

    fn cool_down(&mut self, cooldown: Duration) {
        let until = Instant::now() + cooldown;
        self.not_before = self.not_before.max(until);
        self.next_tick = self.next_tick.max(until);
    }

    fn cooling(&self) -> bool {
        Instant::now() < self.not_before
    }
}

enum Job {
    Discovered(Result<Vec<Meter>, FetchError>),
    Polled {
        meter_id: String,
        result: Result<SyncReport, SyncError>,
    },
}

pub struct Scheduler {
    engine: Arc<SyncEngine>,
    registry: Arc<Registry>,
    discovery: Arc<dyn MeterDiscovery>,
    rate_limit_cooldown: Duration,
}

impl Scheduler {
    pub fn new(
        engine: Arc<SyncEngine>,
        registry: Arc<Registry>,
        discovery: Arc<dyn MeterDiscovery>,
        rate_limit_cooldown: Duration,
    ) -> Self {
        Self {
            engine,
            registry,
            discovery,
            rate_limit_cooldown,
        }
    }

    /// One task per account. Tasks stop once `cancel` fires and their
    /// admitted batches have finished.
    pub fn spawn(self: &Arc<Self>, accounts: &AccountSet, cancel: CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        for account in accounts.iter() {
            let this = self.clone();
            let account = account.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { this.run_account(account, cancel).await });
        }
        tasks
    }

    async fn run_account(&self, account: Arc<AccountHandle>, cancel: CancellationToken) {
        let mut credentials_rx = account.credentials.subscribe();
        let mut jobs: JoinSet<Job> = JoinSet::new();
        let mut schedule = Schedule::new();
        let mut suspended = false;
        let mut discovering = false;

        tracing::info!(account_id = %account.id, "account polling started");

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                    match joined {
                        Ok(job) => {
                            self.finish(&account, job, &mut schedule, &mut suspended, &mut discovering)
                                .await;
                        }
                        Err(e) => {
                            // Discovery and polls are never in flight together.
                            discovering = false;
                            tracing::error!(account_id = %account.id, error = %e, "sync task failed");
                            account.status.send_modify(|s| s.last_error = Some(e.to_string()));
                        }
                    }
                    let remaining = jobs.len();
                    account.status.send_modify(|s| {
                        s.in_flight = remaining;
                        if remaining == 0 && s.state == AccountState::Polling {
                            s.state = AccountState::Idle;
                        }
                    });
                }

                changed = credentials_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    tracing::info!(account_id = %account.id, "credentials replaced");
                    if suspended {
                        suspended = false;
                        account.set_state(AccountState::Idle);
                    }
                    schedule.wake();
                }

                _ = account.refresh.notified() => {
                    let Some(scope) = account.take_refresh() else {
                        continue;
                    };
                    if suspended {
                        tracing::debug!(account_id = %account.id, "refresh ignored, account suspended");
                        continue;
                    }
                    if schedule.cooling() {
                        // The tick at the end of the cooldown polls every meter.
                        tracing::debug!(account_id = %account.id, "refresh ignored, cooling down");
                        continue;
                    }
                    tracing::info!(account_id = %account.id, scope = ?scope, "refresh requested");
                    self.tick(&account, &mut jobs, &mut discovering, Some(&scope)).await;
                    let in_flight = jobs.len();
                    account.status.send_modify(|s| s.in_flight = in_flight);
                }

                _ = sleep_until(schedule.next_tick), if !suspended => {
                    schedule.after(account.poll_config().interval());
                    self.tick(&account, &mut jobs, &mut discovering, None).await;
                    let in_flight = jobs.len();
                    account.status.send_modify(|s| s.in_flight = in_flight);
                }
            }
        }

        if !jobs.is_empty() {
            tracing::info!(account_id = %account.id, in_flight = jobs.len(), "waiting for running batches");
        }
        while jobs.join_next().await.is_some() {}
        tracing::info!(account_id = %account.id, "account polling stopped");
    }

    /// Spawn a poll for every idle meter in `scope`, or discovery when the
    /// account has no meters yet.
    async fn tick(
        &self,
        account: &AccountHandle,
        jobs: &mut JoinSet<Job>,
        discovering: &mut bool,
        scope: Option<&RefreshScope>,
    ) {
        if matches!(account.status().state, AccountState::CoolingDown { .. }) {
            account.set_state(AccountState::Idle);
        }
        let credentials = account.credentials();

        let plans = match self.registry.plans(&account.id).await {
            Some(plans) if !plans.is_empty() => plans,
            _ => {
                if !*discovering {
                    *discovering = true;
                    let discovery = self.discovery.clone();
                    let allowlist = account.allowlist.clone();
                    jobs.spawn(async move {
                        Job::Discovered(discovery.discover(&credentials, allowlist.as_deref()).await)
                    });
                    account.set_state(AccountState::Polling);
                }
                return;
            }
        };

        for plan in plans.iter() {
            if scope.is_some_and(|scope| !scope.includes(plan.meter_id())) {
                continue;
            }
            let Some(guard) = account.locks.try_acquire(plan.meter_id()) else {
                tracing::debug!(
                    account_id = %account.id,
                    meter_id = plan.meter_id(),
                    "meter busy, skipping tick"
                );
                metrics::counter!("poll_ticks_skipped_total").increment(1);
                continue;
            };

            let engine = self.engine.clone();
            let plan = plan.clone();
            let credentials = credentials.clone();
            jobs.spawn(async move {
                let result = engine.poll_meter(&guard, &credentials, &plan).await;
                Job::Polled {
                    meter_id: plan.meter.meter_id,
                    result,
                }
            });
        }

        if !jobs.is_empty() {
            account.set_state(AccountState::Polling);
        }
    }

    async fn finish(
        &self,
        account: &AccountHandle,
        job: Job,
        schedule: &mut Schedule,
        suspended: &mut bool,
        discovering: &mut bool,
    ) {
        match job {
            Job::Discovered(Ok(meters)) => {
                *discovering = false;
                self.registry.install(&account.id, meters).await;
                schedule.wake();
            }
            Job::Discovered(Err(e)) => {
                *discovering = false;
                self.on_fetch_error(account, None, e, schedule, suspended);
            }
            Job::Polled {
                meter_id,
                result: Ok(report),
            } => {
                metrics::counter!("poll_cycles_total", "outcome" => "ok").increment(1);
                let now = self.engine.clock().now();
                account.status.send_modify(|s| {
                    s.last_success = Some(now);
                    s.last_error = None;
                });
                tracing::debug!(
                    account_id = %account.id,
                    meter_id = %meter_id,
                    pages = report.pages,
                    points = report.points_written,
                    "poll cycle finished"
                );
            }
            Job::Polled {
                meter_id,
                result: Err(SyncError::Fetch(e)),
            } => {
                self.on_fetch_error(account, Some(&meter_id), e, schedule, suspended);
            }
            Job::Polled {
                meter_id,
                result: Err(e),
            } => {
                metrics::counter!("poll_cycles_total", "outcome" => "error").increment(1);
                tracing::warn!(
                    account_id = %account.id,
                    meter_id = %meter_id,
                    error = %e,
                    "poll cycle failed, retrying on next tick"
                );
                account.status.send_modify(|s| s.last_error = Some(e.to_string()));
            }
        }
    }

    fn on_fetch_error(
        &self,
        account: &AccountHandle,
        meter_id: Option<&str>,
        error: FetchError,
        schedule: &mut Schedule,
        suspended: &mut bool,
    ) {
        match &error {
            FetchError::RateLimited { retry_after } => {
                let cooldown = retry_after.unwrap_or(self.rate_limit_cooldown);
                schedule.cool_down(cooldown);
                let until = self.engine.clock().now() + cooldown;
                metrics::counter!("poll_cycles_total", "outcome" => "rate_limited").increment(1);
                tracing::warn!(
                    account_id = %account.id,
                    meter_id = ?meter_id,
                    cooldown_secs = cooldown.as_secs(),
                    "rate limited by vendor, delaying next poll"
                );
                account.set_state(AccountState::CoolingDown { until });
            }
            FetchError::Auth(reason) => {
                *suspended = true;
                metrics::counter!("poll_cycles_total", "outcome" => "auth").increment(1);
                tracing::error!(
                    account_id = %account.id,
                    meter_id = ?meter_id,
                    reason = %reason,
                    "credentials rejected, polling suspended until they are replaced"
                );
                account.set_state(AccountState::Suspended {
                    reason: reason.clone(),
                });
            }
            FetchError::Transport(reason) => {
                metrics::counter!("poll_cycles_total", "outcome" => "transport").increment(1);
                tracing::warn!(
                    account_id = %account.id,
                    meter_id = ?meter_id,
                    reason = %reason,
                    "fetch failed, retrying on next tick"
                );
            }
        }
        account
            .status
            .send_modify(|s| s.last_error = Some(error.to_string()));
    }
}
