//! Per-session health supervision.
//!
//! One supervisor runs for every session a device accepted. It polls the
//! executor, restarts unhealthy sessions with the same task, and settles the
//! session exactly once when it ends on its own.

use super::backoff::pause;
use super::registry::{Device, DevicePhase};
use super::shared::{FarmShared, TaskOrigin};
use crate::queue::task::Task;
use crate::runtime::executor::{DeviceStatus, Profile, SessionExecutor};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

pub(crate) struct SupervisorContext {
    pub shared: Arc<FarmShared>,
    pub device: Arc<Device>,
    pub profile: Profile,
    pub task: Task,
    pub origin: TaskOrigin,
    pub session: u64,
    pub token: CancellationToken,
}

/// Join handles of the running supervisors keyed by device id.
#[derive(Debug, Default)]
pub(crate) struct SupervisorSet {
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SupervisorSet {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, device_id: &str, handle: JoinHandle<()>) {
        if let Some(previous) = self.lock().insert(device_id.to_string(), handle) {
            if !previous.is_finished() {
                tracing::warn!(device = %device_id, "replacing a supervisor that is still running");
                previous.abort();
            }
        }
    }

    /// Whether `device_id` has a supervisor that has not exited yet.
    pub(crate) fn is_supervised(&self, device_id: &str) -> bool {
        self.lock()
            .get(device_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub(crate) fn drain(&self) -> Vec<(String, JoinHandle<()>)> {
        self.lock().drain().collect()
    }

    pub(crate) fn abort_all(&self) {
        for (_, handle) in self.drain() {
            handle.abort();
        }
    }
}

pub(crate) fn spawn_supervisor(ctx: SupervisorContext) -> JoinHandle<()> {
    tokio::spawn(supervise(ctx))
}

async fn supervise(ctx: SupervisorContext) {
    let SupervisorContext {
        shared,
        device,
        profile,
        mut task,
        origin,
        session,
        token,
    } = ctx;
    let executor = device.executor();
    let interval = shared.config.health_check_interval();
    let max_duration = device.config().max_session_duration();
    let started = Instant::now();
    let mut marked_running = false;

    tracing::debug!(device = %device.id(), task = %task.id, session, "supervisor started");

    loop {
        if token.is_cancelled() {
            tracing::debug!(device = %device.id(), "supervisor cancelled");
            return;
        }

        if !executor.is_active() {
            finish_session(&shared, &device, executor.as_ref(), &task, origin, session, &token).await;
            return;
        }

        if !marked_running && origin == TaskOrigin::Queue {
            shared.queue.mark_running(&task.id);
            marked_running = true;
        }

        if started.elapsed() > max_duration {
            tracing::info!(
                device = %device.id(),
                task = %task.id,
                max_secs = max_duration.as_secs(),
                "session exceeded its maximum duration; stopping"
            );
            stop_quietly(&shared, executor.as_ref(), &device).await;
            finish_session(&shared, &device, executor.as_ref(), &task, origin, session, &token).await;
            return;
        }

        if !pause(interval, &token).await {
            tracing::debug!(device = %device.id(), "supervisor cancelled");
            return;
        }

        if !executor.is_active() || executor.is_healthy().await {
            continue;
        }

        device.set_phase(DevicePhase::Unhealthy);
        tracing::warn!(device = %device.id(), task = %task.id, "session unhealthy; restarting");

        let current = current_task(&shared, executor.as_ref(), &device)
            .await
            .unwrap_or_else(|| task.clone());

        device.set_phase(DevicePhase::Restarting);
        shared.telemetry.record_restart();

        let outcome = restart(executor.as_ref(), &profile, &current).await;
        if token.is_cancelled() {
            // The farm stopped this device while the restart was in flight.
            tracing::debug!(device = %device.id(), "restart finished after cancellation; stopping session");
            stop_quietly(&shared, executor.as_ref(), &device).await;
            device.release();
            return;
        }

        match outcome {
            Ok(()) => {
                device.set_phase(DevicePhase::Active);
                tracing::info!(device = %device.id(), task = %current.id, "session restarted");
                task = current;
            }
            Err(err) => {
                tracing::error!(
                    device = %device.id(),
                    task = %current.id,
                    error = %err,
                    "session restart failed; releasing device"
                );
                fail_session(&shared, &device, &current, origin, session);
                return;
            }
        }
    }
}

async fn stop_quietly(shared: &FarmShared, executor: &dyn SessionExecutor, device: &Device) {
    match timeout(shared.config.shutdown_timeout(), executor.stop_session()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::debug!(device = %device.id(), error = %err, "session stop failed");
        }
        Err(_) => {
            tracing::debug!(device = %device.id(), "session stop timed out");
        }
    }
}

async fn current_task(
    shared: &FarmShared,
    executor: &dyn SessionExecutor,
    device: &Device,
) -> Option<Task> {
    match timeout(shared.config.status_timeout(), executor.status()).await {
        Ok(Ok(status)) => status.current_task,
        Ok(Err(err)) => {
            tracing::debug!(device = %device.id(), error = %err, "status unavailable before restart");
            None
        }
        Err(_) => None,
    }
}

async fn restart(executor: &dyn SessionExecutor, profile: &Profile, task: &Task) -> Result<()> {
    let accepted = match executor.restart_session() {
        Some(restart) => restart.await?,
        None => {
            if let Err(err) = executor.stop_session().await {
                tracing::debug!(error = %err, "stop before restart failed");
            }
            executor.start_session(profile.clone(), task.clone()).await?
        }
    };

    if !accepted {
        bail!("executor declined to restart the session");
    }
    Ok(())
}

/// Settles a naturally finished session. Only the caller that releases the
/// device counts it.
async fn finish_session(
    shared: &FarmShared,
    device: &Device,
    executor: &dyn SessionExecutor,
    task: &Task,
    origin: TaskOrigin,
    session: u64,
    token: &CancellationToken,
) {
    let status = match timeout(shared.config.status_timeout(), executor.status()).await {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            tracing::debug!(device = %device.id(), error = %err, "final status unavailable");
            DeviceStatus::unavailable(device.id())
        }
        Err(_) => DeviceStatus::unavailable(device.id()),
    };

    // A stop may have ended the session underneath us; that is not a completion.
    if token.is_cancelled() || !device.release() {
        tracing::debug!(device = %device.id(), "session already released elsewhere");
        return;
    }

    let telemetry = &shared.telemetry;
    telemetry.record_session_ended();
    telemetry.record_completion();
    telemetry.record_login(status.login_success);
    telemetry.settle_engagement(device.id(), session, &status.metrics);

    if origin == TaskOrigin::Queue {
        shared.queue.mark_completed(&task.id);
    }

    tracing::info!(
        device = %device.id(),
        task = %task.id,
        login_success = status.login_success,
        duration_secs = status.session_duration_secs,
        "session completed"
    );
}

fn fail_session(shared: &FarmShared, device: &Device, task: &Task, origin: TaskOrigin, session: u64) {
    if !device.release() {
        return;
    }

    let telemetry = &shared.telemetry;
    telemetry.record_session_ended();
    telemetry.record_failed_restart();
    telemetry.settle_engagement(device.id(), session, &Default::default());

    if origin == TaskOrigin::Queue {
        shared.queue.mark_failed(&task.id);
    }
}
