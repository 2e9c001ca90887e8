//! Account rotation: replays tasks loop by loop in one of three modes instead
//! of letting the dispatch loop drain the queue.

use super::config::{RotationConfig, RotationMode};
use super::status::{RotationState, RotationStatus};
use crate::farm::backoff::{pause, panic_message};
use crate::farm::shared::{FarmShared, TaskOrigin};
use crate::queue::task::Task;
use futures::FutureExt;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct RotationRun {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub(crate) struct RotationEngine {
    shared: Arc<FarmShared>,
    state: Arc<Mutex<RotationState>>,
    run: Mutex<Option<RotationRun>>,
}

impl RotationEngine {
    pub(crate) fn new(shared: Arc<FarmShared>) -> Self {
        Self {
            shared,
            state: Arc::new(Mutex::new(RotationState::default())),
            run: Mutex::new(None),
        }
    }

    fn run_slot(&self) -> MutexGuard<'_, Option<RotationRun>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the rotation as a child of `parent`. Any previous run is aborted.
    pub(crate) fn start(&self, config: RotationConfig, tasks: Vec<Task>, parent: &CancellationToken) {
        let config = config.normalized();
        lock_state(&self.state).begin(config.mode, config.loops, config.total_accounts);

        let token = parent.child_token();
        let rotation = Rotation {
            shared: Arc::clone(&self.shared),
            state: Arc::clone(&self.state),
            config,
            token: token.clone(),
        };
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            let outcome = std::panic::AssertUnwindSafe(rotation.run(tasks))
                .catch_unwind()
                .await;
            if let Err(panic_payload) = outcome {
                tracing::error!(
                    target: "farmhand::rotation",
                    panic = %panic_message(panic_payload.as_ref()),
                    "rotation task panicked"
                );
            }
            lock_state(&state).finish();
        });

        if let Some(previous) = self.run_slot().replace(RotationRun { token, handle }) {
            previous.token.cancel();
            previous.handle.abort();
        }
    }

    /// Cancels the current rotation and waits up to `join_timeout` for it.
    pub(crate) async fn stop(&self, join_timeout: Duration) {
        let run = self.run_slot().take();
        if let Some(RotationRun { token, handle }) = run {
            token.cancel();
            let abort = handle.abort_handle();
            match timeout(join_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_cancelled() => {}
                Ok(Err(err)) => {
                    tracing::warn!(target: "farmhand::rotation", error = %err, "rotation task failed");
                }
                Err(_) => {
                    tracing::warn!(
                        target: "farmhand::rotation",
                        timeout_ms = join_timeout.as_millis() as u64,
                        "rotation did not stop in time; aborting"
                    );
                    abort.abort();
                }
            }
        }
        lock_state(&self.state).reset();
    }

    /// Aborts the rotation without waiting.
    pub(crate) fn abort(&self) {
        if let Some(run) = self.run_slot().take() {
            run.token.cancel();
            run.handle.abort();
        }
        lock_state(&self.state).reset();
    }

    pub(crate) fn status(&self) -> RotationStatus {
        lock_state(&self.state).status()
    }

    pub(crate) fn is_rotating(&self) -> bool {
        lock_state(&self.state).is_rotating()
    }
}

fn lock_state(state: &Mutex<RotationState>) -> MutexGuard<'_, RotationState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Rotation {
    shared: Arc<FarmShared>,
    state: Arc<Mutex<RotationState>>,
    config: RotationConfig,
    token: CancellationToken,
}

impl Rotation {
    async fn run(self, tasks: Vec<Task>) {
        let mut loops: BTreeMap<u32, Vec<Task>> = BTreeMap::new();
        for task in tasks {
            loops.entry(task.loop_index()).or_default().push(task);
        }

        tracing::info!(
            target: "farmhand::rotation",
            mode = %self.config.mode,
            loops = loops.len(),
            total_accounts = self.config.total_accounts,
            "rotation started"
        );

        for (loop_index, tasks) in loops {
            if self.token.is_cancelled() {
                break;
            }

            lock_state(&self.state).enter_loop(loop_index);
            tracing::info!(
                target: "farmhand::rotation",
                loop_index,
                tasks = tasks.len(),
                "rotation loop started"
            );

            match self.config.mode {
                RotationMode::Sequential => self.run_sequential(tasks).await,
                RotationMode::Batch => self.run_batch(tasks).await,
                RotationMode::Concurrent => self.run_concurrent(tasks).await,
            }
        }

        if self.token.is_cancelled() {
            tracing::info!(target: "farmhand::rotation", "rotation cancelled");
        } else {
            tracing::info!(target: "farmhand::rotation", "rotation finished");
        }
    }

    async fn run_sequential(&self, tasks: Vec<Task>) {
        let devices = self.shared.registry.ids();
        let count = tasks.len();

        for (position, task) in tasks.into_iter().enumerate() {
            if self.token.is_cancelled() {
                return;
            }

            match designated_device(&task, &devices) {
                Some(device_id) => {
                    let started = self.execute_single_task(&device_id, task).await;
                    self.advance();
                    if started && !self.wait_until_idle(&device_id).await {
                        return;
                    }
                }
                None => {
                    tracing::warn!(target: "farmhand::rotation", task = %task.id, "no device to run task on");
                    self.advance();
                }
            }

            let is_last = position + 1 == count;
            if !is_last && !pause(self.config.delay_between_accounts, &self.token).await {
                return;
            }
        }
    }

    async fn run_batch(&self, tasks: Vec<Task>) {
        let devices = self.shared.registry.ids();
        let mut waiting: VecDeque<(String, VecDeque<Task>)> = VecDeque::new();

        for task in tasks {
            let Some(device_id) = designated_device(&task, &devices) else {
                tracing::warn!(target: "farmhand::rotation", task = %task.id, "no device to run task on");
                self.advance();
                continue;
            };
            match waiting.iter_mut().find(|(id, _)| *id == device_id) {
                Some((_, queue)) => queue.push_back(task),
                None => waiting.push_back((device_id, VecDeque::from([task]))),
            }
        }

        let max_active = self.config.max_concurrent_devices;
        let mut active: Vec<(String, VecDeque<Task>)> = Vec::new();

        loop {
            while active.len() < max_active {
                let Some((device_id, mut queue)) = waiting.pop_front() else {
                    break;
                };
                if self.start_next(&device_id, &mut queue).await {
                    active.push((device_id, queue));
                }
                if self.token.is_cancelled() {
                    return;
                }
            }

            if active.is_empty() && waiting.is_empty() {
                return;
            }

            if !pause(self.shared.config.rotation_poll_interval(), &self.token).await {
                return;
            }

            let mut still_active = Vec::with_capacity(active.len());
            for (device_id, mut queue) in active.drain(..) {
                if self.device_busy(&device_id) {
                    still_active.push((device_id, queue));
                    continue;
                }
                if self.start_next(&device_id, &mut queue).await {
                    still_active.push((device_id, queue));
                } else {
                    tracing::debug!(target: "farmhand::rotation", device = %device_id, "device has no remaining work");
                }
            }
            active = still_active;
        }
    }

    async fn run_concurrent(&self, tasks: Vec<Task>) {
        let devices: Vec<String> = self
            .shared
            .registry
            .ids()
            .into_iter()
            .take(self.config.max_concurrent_devices)
            .collect();
        if devices.is_empty() {
            tracing::warn!(target: "farmhand::rotation", "no devices available for concurrent rotation");
            return;
        }

        for (position, task) in tasks.into_iter().enumerate() {
            if self.token.is_cancelled() {
                return;
            }

            let device_id = &devices[position % devices.len()];
            // Only this task's own device has to be free; the others keep running.
            if !self.wait_until_idle(device_id).await {
                return;
            }
            let task_id = task.id.clone();
            if !self.execute_single_task(device_id, task).await {
                tracing::warn!(target: "farmhand::rotation", device = %device_id, task = %task_id, "rotation task did not start");
            }
            self.advance();
        }
    }

    /// Starts the next task of `queue` on `device_id`, skipping tasks that fail to start.
    async fn start_next(&self, device_id: &str, queue: &mut VecDeque<Task>) -> bool {
        while let Some(task) = queue.pop_front() {
            if self.token.is_cancelled() {
                return false;
            }
            let task_id = task.id.clone();
            let started = self.execute_single_task(device_id, task).await;
            self.advance();
            if started {
                return true;
            }
            tracing::warn!(target: "farmhand::rotation", device = %device_id, task = %task_id, "rotation task did not start");
        }
        false
    }

    async fn execute_single_task(&self, device_id: &str, task: Task) -> bool {
        self.shared
            .start_device(device_id, task, TaskOrigin::Rotation, &self.token)
            .await
    }

    fn device_busy(&self, device_id: &str) -> bool {
        self.shared
            .registry
            .get(device_id)
            .is_some_and(|device| device.in_session())
    }

    /// Polls until `device_id` holds no session. Returns `false` on cancellation.
    async fn wait_until_idle(&self, device_id: &str) -> bool {
        while self.device_busy(device_id) {
            if !pause(self.shared.config.rotation_poll_interval(), &self.token).await {
                return false;
            }
        }
        !self.token.is_cancelled()
    }

    fn advance(&self) {
        lock_state(&self.state).advance();
    }
}

/// The task's planned device, or `devices[account_index % n]` when it has none.
fn designated_device(task: &Task, devices: &[String]) -> Option<String> {
    if let Some(device_id) = task.designated_device() {
        return Some(device_id.to_string());
    }
    if devices.is_empty() {
        return None;
    }
    Some(devices[task.account_index() % devices.len()].clone())
}
