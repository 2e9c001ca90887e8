use crate::farm::registry::DeviceRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, timeout, MissedTickBehavior};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Engagement counters folded across device sessions.
///
/// Live sessions are merged with a per-key maximum, so a counter sampled twice
/// is never double counted; a session is added to the settled totals once.
#[derive(Debug, Default)]
pub struct EngagementLedger {
    settled: BTreeMap<String, u64>,
    live: HashMap<String, LiveSession>,
    settled_sessions: HashMap<String, u64>,
}

#[derive(Debug)]
struct LiveSession {
    session: u64,
    metrics: BTreeMap<String, u64>,
}

impl EngagementLedger {
    /// Merges an intermediate sample for `device`'s `session`.
    pub fn observe(&mut self, device: &str, session: u64, metrics: &BTreeMap<String, u64>) {
        if self.is_settled(device, session) {
            return;
        }

        let live_session = self.live.get(device).map(|live| live.session);
        match live_session {
            Some(current) if current > session => return,
            Some(current) if current < session => {
                // Superseded without a settlement (for example after a cancelled run).
                if let Some(previous) = self.live.remove(device) {
                    self.settle_totals(previous.metrics);
                }
                self.settled_sessions.insert(device.to_string(), current);
            }
            _ => {}
        }

        let entry = self
            .live
            .entry(device.to_string())
            .or_insert_with(|| LiveSession {
                session,
                metrics: BTreeMap::new(),
            });
        merge_max(&mut entry.metrics, metrics);
    }

    /// Folds the final counters of `device`'s `session` into the totals.
    ///
    /// Returns `false` when this session was already settled.
    pub fn settle(&mut self, device: &str, session: u64, metrics: &BTreeMap<String, u64>) -> bool {
        if self.is_settled(device, session) {
            return false;
        }

        let mut merged = BTreeMap::new();
        if let Some(live) = self.live.remove(device) {
            if live.session == session {
                merged = live.metrics;
            } else if live.session < session {
                self.settle_totals(live.metrics);
            } else {
                self.live.insert(device.to_string(), live);
            }
        }
        merge_max(&mut merged, metrics);
        self.settle_totals(merged);
        self.settled_sessions.insert(device.to_string(), session);
        true
    }

    /// Settled totals plus every live session's current counters.
    pub fn totals(&self) -> BTreeMap<String, u64> {
        let mut totals = self.settled.clone();
        for live in self.live.values() {
            for (key, value) in &live.metrics {
                *totals.entry(key.clone()).or_default() += value;
            }
        }
        totals
    }

    pub fn clear(&mut self) {
        self.settled.clear();
        self.live.clear();
        self.settled_sessions.clear();
    }

    fn is_settled(&self, device: &str, session: u64) -> bool {
        self.settled_sessions
            .get(device)
            .is_some_and(|last| *last >= session)
    }

    fn settle_totals(&mut self, metrics: BTreeMap<String, u64>) {
        for (key, value) in metrics {
            *self.settled.entry(key).or_default() += value;
        }
    }
}

fn merge_max(target: &mut BTreeMap<String, u64>, sample: &BTreeMap<String, u64>) {
    for (key, value) in sample {
        let slot = target.entry(key.clone()).or_default();
        *slot = (*slot).max(*value);
    }
}

/// Farm-wide counters shared by the dispatch loop, supervisors and the aggregator.
#[derive(Default, Debug)]
pub struct FarmTelemetry {
    total_devices: AtomicU64,
    active_sessions: AtomicU64,
    completed_tasks: AtomicU64,
    login_successes: AtomicU64,
    login_failures: AtomicU64,
    restarts: AtomicU64,
    failed_restarts: AtomicU64,
    uptime_secs: AtomicU64,
    next_session: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
    engagement: Mutex<EngagementLedger>,
}

impl FarmTelemetry {
    fn started_at_guard(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.started_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ledger(&self) -> MutexGuard<'_, EngagementLedger> {
        self.engagement.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a new run: stamps the start time and zeroes the per-run session counters.
    pub fn begin_run(&self, total_devices: usize) {
        *self.started_at_guard() = Some(Utc::now());
        self.uptime_secs.store(0, Ordering::Relaxed);
        self.total_devices
            .store(total_devices as u64, Ordering::Relaxed);
        self.active_sessions.store(0, Ordering::Relaxed);
        self.completed_tasks.store(0, Ordering::Relaxed);
    }

    /// Allocates a session number unique for the lifetime of this telemetry.
    pub fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_session_started(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_ended(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(1))
            });
    }

    pub fn record_completion(&self) {
        self.completed_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_login(&self, success: bool) {
        if success {
            self.login_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.login_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_restart(&self) {
        self.failed_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_engagement(&self, device: &str, session: u64, metrics: &BTreeMap<String, u64>) {
        self.ledger().observe(device, session, metrics);
    }

    pub fn settle_engagement(
        &self,
        device: &str,
        session: u64,
        metrics: &BTreeMap<String, u64>,
    ) -> bool {
        self.ledger().settle(device, session, metrics)
    }

    /// Recomputes uptime from the run's start time.
    pub fn refresh_uptime(&self) -> u64 {
        let uptime = self
            .started_at_guard()
            .map(|started| (Utc::now() - started).num_seconds().max(0) as u64)
            .unwrap_or(0);
        self.uptime_secs.store(uptime, Ordering::Relaxed);
        uptime
    }

    pub fn reset_sessions(&self) {
        self.active_sessions.store(0, Ordering::Relaxed);
    }

    /// Zeroes every counter, the start time and the engagement ledger.
    pub fn reset(&self) {
        for counter in [
            &self.total_devices,
            &self.active_sessions,
            &self.completed_tasks,
            &self.login_successes,
            &self.login_failures,
            &self.restarts,
            &self.failed_restarts,
            &self.uptime_secs,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.started_at_guard() = None;
        self.ledger().clear();
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn completed_tasks(&self) -> u64 {
        self.completed_tasks.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> FarmStatsSnapshot {
        FarmStatsSnapshot {
            total_devices: self.total_devices.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            login_successes: self.login_successes.load(Ordering::Relaxed),
            login_failures: self.login_failures.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            failed_restarts: self.failed_restarts.load(Ordering::Relaxed),
            uptime_secs: self.uptime_secs.load(Ordering::Relaxed),
            start_time: *self.started_at_guard(),
            engagement: self.ledger().totals(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FarmStatsSnapshot {
    pub total_devices: u64,
    pub active_sessions: u64,
    pub completed_tasks: u64,
    pub login_successes: u64,
    pub login_failures: u64,
    pub restarts: u64,
    pub failed_restarts: u64,
    pub uptime_secs: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub engagement: BTreeMap<String, u64>,
}

/// Spawns the stats aggregator: refreshes uptime, samples every device in a
/// session and logs a metrics snapshot on each tick.
pub fn spawn_stats_aggregator(
    telemetry: Arc<FarmTelemetry>,
    registry: Arc<DeviceRegistry>,
    shutdown: CancellationToken,
    interval: Duration,
    status_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(target: "farmhand::metrics", "stats aggregator shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let uptime = telemetry.refresh_uptime();

                    for device in registry.snapshot() {
                        if shutdown.is_cancelled() {
                            break;
                        }
                        if !device.in_session() {
                            continue;
                        }
                        let session = device.session_id();
                        match timeout(status_timeout, device.executor().status()).await {
                            Ok(Ok(status)) => {
                                telemetry.observe_engagement(device.id(), session, &status.metrics);
                            }
                            Ok(Err(err)) => {
                                tracing::debug!(
                                    target: "farmhand::metrics",
                                    device = %device.id(),
                                    error = %err,
                                    "skipping device status this tick"
                                );
                            }
                            Err(_) => {
                                tracing::debug!(
                                    target: "farmhand::metrics",
                                    device = %device.id(),
                                    timeout_ms = status_timeout.as_millis() as u64,
                                    "device status timed out"
                                );
                            }
                        }
                    }

                    let snapshot = telemetry.snapshot();
                    tracing::info!(
                        target: "farmhand::metrics",
                        uptime_secs = uptime,
                        devices = snapshot.total_devices,
                        active_sessions = snapshot.active_sessions,
                        completed_tasks = snapshot.completed_tasks,
                        login_successes = snapshot.login_successes,
                        login_failures = snapshot.login_failures,
                        restarts = snapshot.restarts,
                        failed_restarts = snapshot.failed_restarts,
                        "farm metrics snapshot"
                    );
                }
            }
        }
    })
}
