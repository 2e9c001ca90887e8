use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use farmhand::{
    Credential, DeviceConfig, DeviceStatus, ExecutorFactory, ExecutorFuture, Profile,
    ProfileStore, SessionExecutor, Task, TaskId,
};
use tokio::time::sleep;

/// Something a scripted executor did, in the order it happened across the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    Started { device: String, task: TaskId },
    Finished { device: String },
    Stopped { device: String },
}

#[derive(Debug, Clone)]
pub struct ExecutorBehavior {
    /// Sessions end on their own after this long; `None` waits for [`ScriptedExecutor::finish`].
    pub session_length: Option<Duration>,
    /// Extra time every start after the first one takes before it is accepted.
    pub restart_delay: Option<Duration>,
    /// Executors start out declining sessions until [`ScriptedExecutor::set_accept`].
    pub decline_sessions: bool,
    pub fail_stop: bool,
    pub in_place_restart: bool,
    pub login_success: bool,
    pub metrics: BTreeMap<String, u64>,
}

impl Default for ExecutorBehavior {
    fn default() -> Self {
        Self {
            session_length: None,
            restart_delay: None,
            decline_sessions: false,
            fail_stop: false,
            in_place_restart: false,
            login_success: true,
            metrics: BTreeMap::new(),
        }
    }
}

impl ExecutorBehavior {
    pub fn timed(length: Duration) -> Self {
        Self {
            session_length: Some(length),
            ..Self::default()
        }
    }
}

pub struct ScriptedExecutor {
    device_id: String,
    behavior: ExecutorBehavior,
    accept: AtomicBool,
    active: Arc<AtomicBool>,
    healthy: AtomicBool,
    generation: Arc<AtomicU64>,
    current: Mutex<Option<Task>>,
    started: Mutex<Vec<TaskId>>,
    last_profile: Mutex<Option<Profile>>,
    stop_calls: AtomicUsize,
    restart_calls: AtomicUsize,
    events: Arc<Mutex<Vec<FleetEvent>>>,
}

impl ScriptedExecutor {
    fn new(device_id: &str, behavior: ExecutorBehavior, events: Arc<Mutex<Vec<FleetEvent>>>) -> Self {
        Self {
            device_id: device_id.to_string(),
            accept: AtomicBool::new(!behavior.decline_sessions),
            behavior,
            active: Arc::new(AtomicBool::new(false)),
            healthy: AtomicBool::new(true),
            generation: Arc::new(AtomicU64::new(0)),
            current: Mutex::new(None),
            started: Mutex::new(Vec::new()),
            last_profile: Mutex::new(None),
            stop_calls: AtomicUsize::new(0),
            restart_calls: AtomicUsize::new(0),
            events,
        }
    }

    /// Ends the current session as if its work completed.
    pub fn finish(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        // The event lands before anyone can observe the session as over.
        let mut events = self.events.lock().unwrap();
        if self.active.swap(false, Ordering::SeqCst) {
            events.push(FleetEvent::Finished {
                device: self.device_id.clone(),
            });
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub fn started_tasks(&self) -> Vec<TaskId> {
        self.started.lock().unwrap().clone()
    }

    pub fn last_credential(&self) -> Option<Credential> {
        self.last_profile
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|profile| profile.credential.clone())
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn restart_calls(&self) -> usize {
        self.restart_calls.load(Ordering::SeqCst)
    }
}

impl SessionExecutor for ScriptedExecutor {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    fn start_session(&self, profile: Profile, task: Task) -> ExecutorFuture<'_, Result<bool>> {
        Box::pin(async move {
            if !self.accept.load(Ordering::SeqCst) {
                return Ok(false);
            }
            let restarting = !self.started.lock().unwrap().is_empty();
            if let (true, Some(delay)) = (restarting, self.behavior.restart_delay) {
                sleep(delay).await;
            }

            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.active.store(true, Ordering::SeqCst);
            self.healthy.store(true, Ordering::SeqCst);
            self.started.lock().unwrap().push(task.id.clone());
            self.events.lock().unwrap().push(FleetEvent::Started {
                device: self.device_id.clone(),
                task: task.id.clone(),
            });
            *self.current.lock().unwrap() = Some(task);
            *self.last_profile.lock().unwrap() = Some(profile);

            if let Some(length) = self.behavior.session_length {
                let active = Arc::clone(&self.active);
                let current_generation = Arc::clone(&self.generation);
                let events = Arc::clone(&self.events);
                let device = self.device_id.clone();
                tokio::spawn(async move {
                    sleep(length).await;
                    let mut events = events.lock().unwrap();
                    if current_generation.load(Ordering::SeqCst) == generation
                        && active.swap(false, Ordering::SeqCst)
                    {
                        events.push(FleetEvent::Finished { device });
                    }
                });
            }
            Ok(true)
        })
    }

    fn stop_session(&self) -> ExecutorFuture<'_, Result<()>> {
        Box::pin(async move {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.active.store(false, Ordering::SeqCst);
            self.events.lock().unwrap().push(FleetEvent::Stopped {
                device: self.device_id.clone(),
            });
            if self.behavior.fail_stop {
                bail!("{} refused to stop", self.device_id);
            }
            Ok(())
        })
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn is_healthy(&self) -> ExecutorFuture<'_, bool> {
        Box::pin(async move { self.healthy.load(Ordering::SeqCst) })
    }

    fn status(&self) -> ExecutorFuture<'_, Result<DeviceStatus>> {
        Box::pin(async move {
            let is_active = self.active.load(Ordering::SeqCst);
            Ok(DeviceStatus {
                device_id: self.device_id.clone(),
                is_active,
                login_success: self.behavior.login_success,
                current_task: if is_active {
                    self.current.lock().unwrap().clone()
                } else {
                    None
                },
                session_duration_secs: 0,
                executor: "scripted".to_string(),
                metrics: self.behavior.metrics.clone(),
            })
        })
    }

    fn restart_session(&self) -> Option<ExecutorFuture<'_, Result<bool>>> {
        if !self.behavior.in_place_restart {
            return None;
        }
        Some(Box::pin(async move {
            self.restart_calls.fetch_add(1, Ordering::SeqCst);
            self.healthy.store(true, Ordering::SeqCst);
            Ok(true)
        }))
    }
}

/// Executor factory that hands out [`ScriptedExecutor`]s and keeps them for inspection.
pub struct MockFleet {
    behavior: ExecutorBehavior,
    failing_device: Option<String>,
    build_delay: Option<Duration>,
    executors: Mutex<BTreeMap<String, Arc<ScriptedExecutor>>>,
    events: Arc<Mutex<Vec<FleetEvent>>>,
}

impl MockFleet {
    fn build(
        behavior: ExecutorBehavior,
        failing_device: Option<String>,
        build_delay: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            failing_device,
            build_delay,
            executors: Mutex::new(BTreeMap::new()),
            events: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn new(behavior: ExecutorBehavior) -> Arc<Self> {
        Self::build(behavior, None, None)
    }

    pub fn failing_on(behavior: ExecutorBehavior, device_id: &str) -> Arc<Self> {
        Self::build(behavior, Some(device_id.to_string()), None)
    }

    /// Every executor takes `delay` to build, blocking the starting thread like a real browser launch.
    pub fn slow_to_build(behavior: ExecutorBehavior, delay: Duration) -> Arc<Self> {
        Self::build(behavior, None, Some(delay))
    }

    pub fn executor(&self, device_id: &str) -> Arc<ScriptedExecutor> {
        self.executors
            .lock()
            .unwrap()
            .get(device_id)
            .cloned()
            .unwrap_or_else(|| panic!("no executor built for {device_id}"))
    }

    pub fn events(&self) -> Vec<FleetEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Task ids in the order sessions were started, across all devices.
    pub fn start_order(&self) -> Vec<(String, TaskId)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                FleetEvent::Started { device, task } => Some((device, task)),
                _ => None,
            })
            .collect()
    }
}

impl ExecutorFactory for MockFleet {
    fn create(&self, device_id: &str, _config: &DeviceConfig) -> Result<Arc<dyn SessionExecutor>> {
        if let Some(delay) = self.build_delay {
            std::thread::sleep(delay);
        }
        if self.failing_device.as_deref() == Some(device_id) {
            return Err(anyhow!("no browser available for {device_id}"));
        }
        let executor = Arc::new(ScriptedExecutor::new(
            device_id,
            self.behavior.clone(),
            Arc::clone(&self.events),
        ));
        self.executors
            .lock()
            .unwrap()
            .insert(device_id.to_string(), Arc::clone(&executor));
        Ok(executor as Arc<dyn SessionExecutor>)
    }
}

#[derive(Default)]
pub struct RecordingProfileStore {
    requests: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingProfileStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_for(&self, device_id: &str) {
        self.failing.lock().unwrap().insert(device_id.to_string());
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl ProfileStore for RecordingProfileStore {
    fn create_profile<'a>(&'a self, device_id: &'a str) -> ExecutorFuture<'a, Result<Profile>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(device_id.to_string());
            if self.failing.lock().unwrap().contains(device_id) {
                bail!("profile directory for {device_id} is locked");
            }
            Ok(Profile::new(device_id, format!("mock/{device_id}")))
        })
    }
}
