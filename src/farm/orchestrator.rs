//! The farm's public entry point.

use super::lifecycle::{RunHandles, RunSpawnParams};
use super::registry::{device_id_for, Device, DevicePhase, DeviceRegistry};
use super::shared::FarmShared;
use super::state::{FarmState, FarmStateMachine};
use super::supervisor::SupervisorSet;
use crate::error::FarmError;
use crate::queue::task::{Task, TaskId, TaskPlan, TaskRequest};
use crate::queue::task_queue::{TaskCounts, TaskQueue};
use crate::rotation::config::RotationConfig;
use crate::rotation::engine::RotationEngine;
use crate::rotation::status::RotationStatus;
use crate::runtime::config::{Credential, DeviceConfig, FarmConfig};
use crate::runtime::executor::{DeviceStatus, ExecutorFactory, ProfileStore};
use crate::runtime::telemetry::{FarmStatsSnapshot, FarmTelemetry};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// What `stop` and `force_cleanup` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub was_running: bool,
    /// Devices whose executor acknowledged the stop request.
    pub devices_stopped: usize,
}

/// Farm-wide view returned by [`FarmOrchestrator::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FarmStats {
    pub is_running: bool,
    pub state: FarmState,
    pub rotation_active: bool,
    pub total_accounts: usize,
    pub devices_configured: usize,
    pub tasks: TaskCounts,
    #[serde(flatten)]
    pub counters: FarmStatsSnapshot,
}

/// Coordinates devices, the task queue, the rotation engine and the
/// background units of a run.
///
/// Every entry point takes `&self`, so the orchestrator can be shared behind an
/// `Arc` by whatever surface drives it.
pub struct FarmOrchestrator {
    shared: Arc<FarmShared>,
    executor_factory: Option<Arc<dyn ExecutorFactory>>,
    state: FarmStateMachine,
    rotation: RotationEngine,
    run: Mutex<Option<RunHandles>>,
    accounts: Mutex<Vec<Credential>>,
    shutdown_root: Mutex<CancellationToken>,
}

#[derive(Default)]
pub struct FarmOrchestratorBuilder {
    config: Option<FarmConfig>,
    profile_store: Option<Arc<dyn ProfileStore>>,
    executor_factory: Option<Arc<dyn ExecutorFactory>>,
    shutdown_root: Option<CancellationToken>,
}

impl FarmOrchestratorBuilder {
    pub fn config(mut self, config: FarmConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn profile_store(mut self, store: Arc<dyn ProfileStore>) -> Self {
        self.profile_store = Some(store);
        self
    }

    pub fn executor_factory(mut self, factory: Arc<dyn ExecutorFactory>) -> Self {
        self.executor_factory = Some(factory);
        self
    }

    /// Root token every run token derives from; cancelling it winds down the
    /// background units of the current run.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_root = Some(token);
        self
    }

    /// Missing collaborators are reported by `start`, not here.
    pub fn build(self) -> FarmOrchestrator {
        let shared = Arc::new(FarmShared {
            config: self.config.unwrap_or_default(),
            registry: Arc::new(DeviceRegistry::new()),
            queue: Arc::new(TaskQueue::new()),
            telemetry: Arc::new(FarmTelemetry::default()),
            profile_store: self.profile_store,
            supervisors: SupervisorSet::default(),
        });

        FarmOrchestrator {
            rotation: RotationEngine::new(Arc::clone(&shared)),
            shared,
            executor_factory: self.executor_factory,
            state: FarmStateMachine::default(),
            run: Mutex::new(None),
            accounts: Mutex::new(Vec::new()),
            shutdown_root: Mutex::new(self.shutdown_root.unwrap_or_default()),
        }
    }
}

impl FarmOrchestrator {
    pub fn builder() -> FarmOrchestratorBuilder {
        FarmOrchestratorBuilder::default()
    }

    fn run_slot(&self) -> MutexGuard<'_, Option<RunHandles>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accounts_guard(&self) -> MutexGuard<'_, Vec<Credential>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a queue-driven run: devices are built from `device_configs` and
    /// the dispatch loop drains `plan`.
    pub async fn start(&self, device_configs: Vec<DeviceConfig>, plan: TaskPlan) -> Result<(), FarmError> {
        self.launch(device_configs, plan, None).await
    }

    /// Starts a run whose tasks are scheduled by the rotation engine instead of
    /// the dispatch loop.
    pub async fn start_with_rotation(
        &self,
        device_configs: Vec<DeviceConfig>,
        plan: TaskPlan,
        rotation: RotationConfig,
    ) -> Result<(), FarmError> {
        self.launch(device_configs, plan, Some(rotation)).await
    }

    async fn launch(
        &self,
        device_configs: Vec<DeviceConfig>,
        plan: TaskPlan,
        rotation: Option<RotationConfig>,
    ) -> Result<(), FarmError> {
        let epoch = self.state.begin_start()?;
        tracing::info!(
            target: "farmhand::farm",
            devices = device_configs.len(),
            tasks = plan.len(),
            rotation = ?rotation.as_ref().map(|config| config.mode),
            "starting farm"
        );

        let result = self.initialize(epoch, device_configs, plan, rotation);
        match &result {
            Ok(()) => {
                tracing::info!(
                    target: "farmhand::farm",
                    devices = self.shared.registry.len(),
                    "farm running"
                );
            }
            Err(err) => {
                self.state.abort_start(epoch);
                tracing::warn!(
                    target: "farmhand::farm",
                    error = %err,
                    kind = err.as_label(),
                    "farm start failed"
                );
            }
        }
        result
    }

    fn initialize(
        &self,
        epoch: u64,
        device_configs: Vec<DeviceConfig>,
        plan: TaskPlan,
        rotation: Option<RotationConfig>,
    ) -> Result<(), FarmError> {
        if self.shared.profile_store.is_none() {
            return Err(FarmError::NotInitialized {
                component: "profile store",
            });
        }
        let Some(factory) = self.executor_factory.as_ref() else {
            return Err(FarmError::NotInitialized {
                component: "executor factory",
            });
        };

        let devices = match self.build_devices(factory.as_ref(), device_configs) {
            Ok(devices) => devices,
            Err(err) => {
                self.shared.registry.clear();
                return Err(err);
            }
        };
        let device_count = devices.len();

        self.shared.registry.replace(devices);
        if let Err(err) = self.state.ensure_current(epoch) {
            self.shared.registry.clear();
            return Err(err);
        }

        self.shared.telemetry.begin_run(device_count);
        let rotation = match rotation {
            None => {
                self.shared.queue.load(plan.tasks);
                None
            }
            Some(config) => {
                self.shared.queue.clear();
                let tasks = self.shared.queue.materialize(plan.tasks);
                Some((config, tasks))
            }
        };

        let shutdown_root = self
            .shutdown_root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let handles = RunHandles::spawn(RunSpawnParams {
            shutdown_root: &shutdown_root,
            shared: Arc::clone(&self.shared),
            epoch,
            with_dispatch: rotation.is_none(),
        });
        if let Some((config, tasks)) = rotation {
            self.rotation.start(config, tasks, &handles.run_token);
        }

        if let Some(stale) = self.run_slot().replace(handles) {
            stale.abort(&self.shared);
        }

        if let Err(err) = self.state.complete_start(epoch) {
            // A forced cleanup ran while this start was initializing.
            let mut slot = self.run_slot();
            if slot.as_ref().is_some_and(|handles| handles.epoch == epoch) {
                if let Some(handles) = slot.take() {
                    handles.abort(&self.shared);
                }
            }
            return Err(err);
        }

        Ok(())
    }

    fn build_devices(
        &self,
        factory: &dyn ExecutorFactory,
        device_configs: Vec<DeviceConfig>,
    ) -> Result<Vec<Arc<Device>>, FarmError> {
        let accounts = self.accounts_guard().clone();
        let mut devices = Vec::with_capacity(device_configs.len());

        for (index, mut config) in device_configs.into_iter().enumerate() {
            let device_id = device_id_for(index);
            if config.credential.is_none() {
                config.credential = accounts.get(index).cloned();
            }

            let executor =
                factory
                    .create(&device_id, &config)
                    .map_err(|err| FarmError::DeviceInitialization {
                        device_id: device_id.clone(),
                        reason: format!("{err:#}"),
                    })?;

            tracing::debug!(
                target: "farmhand::farm",
                device = %device_id,
                executor = executor.kind(),
                has_credential = config.credential.is_some(),
                "device initialized"
            );
            devices.push(Arc::new(Device::new(device_id, config, executor)));
        }

        Ok(devices)
    }

    /// Gracefully ends the current run. Calling it while not running is a no-op.
    pub async fn stop(&self) -> StopReport {
        if !self.state.begin_stop() {
            tracing::debug!(target: "farmhand::farm", "stop requested while not running");
            return StopReport::default();
        }
        tracing::info!(target: "farmhand::farm", "stopping farm");

        let join_timeout = self.shared.config.shutdown_timeout();
        self.rotation.stop(join_timeout).await;

        let handles = self.run_slot().take();
        if let Some(handles) = handles.as_ref() {
            // Supervisors must not count the sessions stopped below as completions.
            handles.run_token.cancel();
        }

        let devices_stopped = self.stop_devices().await;
        self.shared.telemetry.reset_sessions();

        if let Some(handles) = handles {
            handles.shutdown(&self.shared, join_timeout).await;
        }

        self.state.finish();
        tracing::info!(target: "farmhand::farm", devices_stopped, "farm stopped");
        StopReport {
            was_running: true,
            devices_stopped,
        }
    }

    /// Tears everything down from any state, ignoring individual failures.
    pub async fn force_cleanup(&self) -> StopReport {
        let previous = self.state.begin_cleanup();
        tracing::warn!(target: "farmhand::farm", previous = ?previous, "forcing farm cleanup");

        self.rotation.abort();
        let handles = self.run_slot().take();
        match handles {
            Some(handles) => handles.abort(&self.shared),
            None => self.shared.supervisors.abort_all(),
        }

        let devices_stopped = self.stop_devices().await;

        self.shared.registry.clear();
        self.shared.queue.reset();
        self.shared.telemetry.reset();
        self.state.finish();

        tracing::info!(target: "farmhand::farm", devices_stopped, "farm cleanup finished");
        StopReport {
            was_running: previous != FarmState::NotRunning,
            devices_stopped,
        }
    }

    /// Asks every device's executor to stop; each call is bounded by the shutdown timeout.
    async fn stop_devices(&self) -> usize {
        let stop_timeout = self.shared.config.shutdown_timeout();
        let mut stopped = 0;

        for device in self.shared.registry.snapshot() {
            let outcome = match timeout(stop_timeout, device.executor().stop_session()).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(FarmError::SessionStop {
                    device_id: device.id().to_string(),
                    reason: format!("{err:#}"),
                }),
                Err(_) => Err(FarmError::SessionStop {
                    device_id: device.id().to_string(),
                    reason: format!("timed out after {stop_timeout:?}"),
                }),
            };

            match outcome {
                Ok(()) => stopped += 1,
                Err(err) => {
                    tracing::warn!(
                        target: "farmhand::farm",
                        device = %device.id(),
                        error = %err,
                        kind = err.as_label(),
                        "device did not stop cleanly"
                    );
                }
            }

            device.release();
            device.set_phase(DevicePhase::Stopped);
        }

        stopped
    }

    /// Validates and queues a task; it is picked up by the next dispatch iteration.
    pub fn add_task(&self, request: TaskRequest) -> Result<TaskId, FarmError> {
        match self.shared.queue.add_task(request) {
            Ok(id) => Ok(id),
            Err(err) => {
                tracing::warn!(target: "farmhand::farm", error = %err, "task rejected");
                Err(err)
            }
        }
    }

    /// Credentials assigned, by position, to devices whose config carries none.
    /// Applied at the next start.
    pub fn update_accounts(&self, accounts: Vec<Credential>) {
        tracing::info!(target: "farmhand::farm", accounts = accounts.len(), "accounts updated");
        *self.accounts_guard() = accounts;
    }

    pub fn stats(&self) -> FarmStats {
        let is_running = self.state.is_running();
        if is_running {
            self.shared.telemetry.refresh_uptime();
        }
        FarmStats {
            is_running,
            state: self.state.state(),
            rotation_active: self.rotation.is_rotating(),
            total_accounts: self.accounts_guard().len(),
            devices_configured: self.shared.registry.len(),
            tasks: self.shared.queue.counts(),
            counters: self.shared.telemetry.snapshot(),
        }
    }

    /// Status of every device; devices that cannot report get a placeholder.
    pub async fn device_statuses(&self) -> BTreeMap<String, DeviceStatus> {
        let status_timeout = self.shared.config.status_timeout();
        let mut statuses = BTreeMap::new();

        for device in self.shared.registry.snapshot() {
            let status = match timeout(status_timeout, device.executor().status()).await {
                Ok(Ok(status)) => status,
                Ok(Err(err)) => {
                    tracing::debug!(target: "farmhand::farm", device = %device.id(), error = %err, "device status unavailable");
                    DeviceStatus::unavailable(device.id())
                }
                Err(_) => DeviceStatus::unavailable(device.id()),
            };
            statuses.insert(device.id().to_string(), status);
        }

        statuses
    }

    pub fn rotation_status(&self) -> RotationStatus {
        self.rotation.status()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.shared.queue.tasks()
    }

    pub fn task_counts(&self) -> TaskCounts {
        self.shared.queue.counts()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.shared.registry.ids()
    }

    pub fn state(&self) -> FarmState {
        self.state.state()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Clone of the root token the run tokens derive from.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown_root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn replace_shutdown_root(&self, token: CancellationToken) {
        *self
            .shutdown_root
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }
}
