//! In-process collaborators: a timed no-op session executor and a memory-backed
//! profile store. They keep the farm runnable without any external automation.

use crate::queue::task::{Task, TaskKind};
use crate::runtime::config::DeviceConfig;
use crate::runtime::executor::{
    DeviceStatus, ExecutorFactory, ExecutorFuture, Profile, ProfileStore, SessionExecutor,
};
use anyhow::{bail, Result};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

pub const SIMULATED_EXECUTOR: &str = "simulated";

/// How long a simulated session keeps working.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SimulatedDurations {
    /// Video sessions 60-180 s, searches 30-90 s, anything else 30-120 s.
    #[default]
    Randomized,
    Fixed(Duration),
}

impl SimulatedDurations {
    pub fn fixed(duration: Duration) -> Self {
        Self::Fixed(duration)
    }

    fn pick(&self, kind: TaskKind) -> Duration {
        match self {
            SimulatedDurations::Fixed(duration) => *duration,
            SimulatedDurations::Randomized => {
                let (low, high) = match kind {
                    TaskKind::VideoWatch => (60, 180),
                    TaskKind::EngagementSearch => (30, 90),
                    TaskKind::SiteVisit | TaskKind::GenericBrowse => (30, 120),
                };
                Duration::from_secs(rand::thread_rng().gen_range(low..=high))
            }
        }
    }
}

struct SimulatedSession {
    task: Task,
    login_success: bool,
    started: Instant,
    ended: Option<Duration>,
    working: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    token: CancellationToken,
}

impl SimulatedSession {
    fn is_working(&self) -> bool {
        self.working.load(Ordering::Acquire)
    }

    fn elapsed(&self) -> Duration {
        self.ended.unwrap_or_else(|| self.started.elapsed())
    }
}

/// Session executor that "works" on a task by sleeping for a while.
///
/// Finished sessions report one engagement unit per listed item of the task.
pub struct SimulatedExecutor {
    device_id: String,
    durations: SimulatedDurations,
    session: Mutex<Option<SimulatedSession>>,
}

impl SimulatedExecutor {
    pub fn new(device_id: impl Into<String>, durations: SimulatedDurations) -> Self {
        Self {
            device_id: device_id.into(),
            durations,
            session: Mutex::new(None),
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<SimulatedSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn engagement_for(task: &Task) -> BTreeMap<String, u64> {
    let (key, count) = match task.kind {
        TaskKind::EngagementSearch => ("searches_performed", task.list("keywords").len()),
        TaskKind::VideoWatch => ("videos_watched", task.list("video_urls").len()),
        TaskKind::SiteVisit => ("pages_visited", task.list("urls").len()),
        TaskKind::GenericBrowse => ("pages_visited", 1),
    };
    BTreeMap::from([(key.to_string(), count as u64)])
}

impl SessionExecutor for SimulatedExecutor {
    fn kind(&self) -> &'static str {
        SIMULATED_EXECUTOR
    }

    fn start_session(&self, profile: Profile, task: Task) -> ExecutorFuture<'_, Result<bool>> {
        Box::pin(async move {
            let mut guard = self.session();
            if guard.as_ref().is_some_and(SimulatedSession::is_working) {
                tracing::warn!(device = %self.device_id, "simulated session already running");
                return Ok(false);
            }

            let duration = self.durations.pick(task.kind);
            let working = Arc::new(AtomicBool::new(true));
            let token = CancellationToken::new();

            let finished = Arc::new(AtomicBool::new(false));
            let work_flag = Arc::clone(&working);
            let finished_flag = Arc::clone(&finished);
            let work_token = token.clone();
            let device_id = self.device_id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = work_token.cancelled() => {}
                    _ = sleep(duration) => {
                        finished_flag.store(true, Ordering::Release);
                        tracing::debug!(device = %device_id, "simulated session finished its work");
                    }
                }
                work_flag.store(false, Ordering::Release);
            });

            tracing::info!(
                device = %self.device_id,
                task = %task.id,
                kind = %task.kind,
                duration_ms = duration.as_millis() as u64,
                "simulated session started"
            );

            *guard = Some(SimulatedSession {
                login_success: profile.credential.is_some(),
                task,
                started: Instant::now(),
                ended: None,
                working,
                finished,
                token,
            });
            Ok(true)
        })
    }

    fn stop_session(&self) -> ExecutorFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(session) = self.session().as_mut() {
                session.token.cancel();
                session.working.store(false, Ordering::Release);
                if session.ended.is_none() {
                    session.ended = Some(session.started.elapsed());
                }
            }
            Ok(())
        })
    }

    fn is_active(&self) -> bool {
        self.session()
            .as_ref()
            .is_some_and(SimulatedSession::is_working)
    }

    fn is_healthy(&self) -> ExecutorFuture<'_, bool> {
        Box::pin(async { true })
    }

    fn status(&self) -> ExecutorFuture<'_, Result<DeviceStatus>> {
        Box::pin(async move {
            let guard = self.session();
            let Some(session) = guard.as_ref() else {
                return Ok(DeviceStatus {
                    device_id: self.device_id.clone(),
                    executor: SIMULATED_EXECUTOR.to_string(),
                    ..DeviceStatus::default()
                });
            };

            let is_active = session.is_working();
            let metrics = if session.finished.load(Ordering::Acquire) {
                engagement_for(&session.task)
            } else {
                BTreeMap::new()
            };

            Ok(DeviceStatus {
                device_id: self.device_id.clone(),
                is_active,
                login_success: session.login_success,
                current_task: is_active.then(|| session.task.clone()),
                session_duration_secs: session.elapsed().as_secs(),
                executor: SIMULATED_EXECUTOR.to_string(),
                metrics,
            })
        })
    }
}

/// Builds a [`SimulatedExecutor`] for every device whose config names no
/// executor or names `simulated`.
#[derive(Debug, Clone, Default)]
pub struct SimulatedExecutorFactory {
    durations: SimulatedDurations,
}

impl SimulatedExecutorFactory {
    pub fn new(durations: SimulatedDurations) -> Self {
        Self { durations }
    }
}

impl ExecutorFactory for SimulatedExecutorFactory {
    fn create(&self, device_id: &str, config: &DeviceConfig) -> Result<Arc<dyn SessionExecutor>> {
        match config.executor.as_deref() {
            None | Some(SIMULATED_EXECUTOR) => {
                let executor = SimulatedExecutor::new(device_id, self.durations.clone());
                Ok(Arc::new(executor) as Arc<dyn SessionExecutor>)
            }
            Some(other) => bail!("unsupported executor '{other}' for {device_id}"),
        }
    }
}

/// Keeps one profile per device in memory.
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    profiles: Mutex<HashMap<String, Profile>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str) -> Option<Profile> {
        self.profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProfileStore for InMemoryProfileStore {
    fn create_profile<'a>(&'a self, device_id: &'a str) -> ExecutorFuture<'a, Result<Profile>> {
        Box::pin(async move {
            let profile = Profile::new(device_id, format!("profiles/profile_{device_id}"));
            self.profiles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(device_id.to_string(), profile.clone());
            Ok(profile)
        })
    }
}
