use super::registry::{DevicePhase, DeviceRegistry};
use super::supervisor::{spawn_supervisor, SupervisorContext, SupervisorSet};
use crate::error::FarmError;
use crate::queue::task::Task;
use crate::queue::task_queue::TaskQueue;
use crate::runtime::config::FarmConfig;
use crate::runtime::executor::ProfileStore;
use crate::runtime::telemetry::FarmTelemetry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Who handed a task to a device; only queue tasks have a queue record to update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskOrigin {
    Queue,
    Rotation,
}

/// State shared by the orchestrator, the dispatch loop, the rotation engine
/// and the supervisors.
pub(crate) struct FarmShared {
    pub config: FarmConfig,
    pub registry: Arc<DeviceRegistry>,
    pub queue: Arc<TaskQueue>,
    pub telemetry: Arc<FarmTelemetry>,
    pub profile_store: Option<Arc<dyn ProfileStore>>,
    pub supervisors: SupervisorSet,
}

impl FarmShared {
    /// Starts `task` on `device_id` and spawns its supervisor.
    ///
    /// Every failure is logged and reported as `false`; the device is released
    /// again unless the session was accepted.
    pub(crate) async fn start_device(
        self: &Arc<Self>,
        device_id: &str,
        task: Task,
        origin: TaskOrigin,
        token: &CancellationToken,
    ) -> bool {
        if token.is_cancelled() {
            return false;
        }

        let Some(device) = self.registry.get(device_id) else {
            let err = FarmError::DeviceNotFound {
                device_id: device_id.to_string(),
            };
            tracing::warn!(task = %task.id, error = %err, kind = err.as_label(), "cannot start task");
            return false;
        };

        let Some(store) = self.profile_store.as_ref() else {
            tracing::error!(device = %device_id, "profile store is not initialized");
            return false;
        };

        if !device.try_claim() {
            tracing::debug!(device = %device_id, "device busy");
            return false;
        }

        let profile = match store.create_profile(device_id).await {
            Ok(profile) => profile,
            Err(err) => {
                tracing::warn!(device = %device_id, error = %err, "failed to create profile");
                device.release();
                return false;
            }
        };

        if let Some(account) = task.assigned_account.clone() {
            device.attach_credential(account);
        }
        let profile = profile.with_credential(device.config().credential);

        let session = self.telemetry.next_session_id();
        device.begin_session(session);

        let executor = device.executor();
        let started = match executor.start_session(profile.clone(), task.clone()).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(FarmError::SessionStart {
                device_id: device_id.to_string(),
                reason: "executor declined the session".to_string(),
            }),
            Err(err) => Err(FarmError::SessionStart {
                device_id: device_id.to_string(),
                reason: format!("{err:#}"),
            }),
        };
        if let Err(err) = started {
            tracing::warn!(
                task = %task.id,
                error = %err,
                kind = err.as_label(),
                "failed to start session"
            );
            device.release();
            return false;
        }

        if token.is_cancelled() {
            // The run ended while the executor was starting; do not leave an orphan session.
            if let Err(err) = executor.stop_session().await {
                tracing::debug!(device = %device_id, error = %err, "stop after cancelled start failed");
            }
            device.release();
            return false;
        }

        self.telemetry.record_session_started();
        if origin == TaskOrigin::Queue {
            self.queue.mark_assigned(&task.id);
        }
        tracing::info!(
            device = %device_id,
            task = %task.id,
            kind = %task.kind,
            session,
            "session started"
        );

        let handle = spawn_supervisor(SupervisorContext {
            shared: Arc::clone(self),
            device: Arc::clone(&device),
            profile,
            task,
            origin,
            session,
            token: token.child_token(),
        });
        self.supervisors.insert(device_id, handle);
        // The supervisor may already have settled a very short session.
        device.transition(DevicePhase::Starting, DevicePhase::Active);
        true
    }

    /// Releases devices that still hold a session flag while no supervisor
    /// watches them. Returns how many were released.
    pub(crate) fn sweep_orphaned(&self) -> usize {
        let mut released = 0;
        for device in self.registry.snapshot() {
            if !device.in_session() || device.phase() != DevicePhase::Active {
                continue;
            }
            if self.supervisors.is_supervised(device.id()) {
                continue;
            }

            let executor_active = device.executor().is_active();
            tracing::warn!(
                target: "farmhand::dispatch",
                device = %device.id(),
                executor_active,
                "device marked active without a supervisor; releasing"
            );
            if device.release() {
                self.telemetry.record_session_ended();
                released += 1;
            }
        }
        released
    }
}
