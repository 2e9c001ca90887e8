//! Background units owned by one farm run.

use super::dispatch::spawn_dispatch_loop;
use super::shared::FarmShared;
use crate::runtime::telemetry::spawn_stats_aggregator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub(crate) struct RunHandles {
    pub epoch: u64,
    pub run_token: CancellationToken,
    dispatch_handle: Option<JoinHandle<()>>,
    stats_handle: Option<JoinHandle<()>>,
}

pub(crate) struct RunSpawnParams<'a> {
    pub shutdown_root: &'a CancellationToken,
    pub shared: Arc<FarmShared>,
    pub epoch: u64,
    /// Rotation runs replace the queue-driven dispatch loop.
    pub with_dispatch: bool,
}

impl RunHandles {
    pub(crate) fn spawn(params: RunSpawnParams<'_>) -> Self {
        let RunSpawnParams {
            shutdown_root,
            shared,
            epoch,
            with_dispatch,
        } = params;

        let run_token = shutdown_root.child_token();
        let stats_handle = spawn_stats_aggregator(
            Arc::clone(&shared.telemetry),
            Arc::clone(&shared.registry),
            run_token.child_token(),
            shared.config.stats_interval(),
            shared.config.status_timeout(),
        );
        let dispatch_handle =
            with_dispatch.then(|| spawn_dispatch_loop(Arc::clone(&shared), run_token.child_token()));

        Self {
            epoch,
            run_token,
            dispatch_handle,
            stats_handle: Some(stats_handle),
        }
    }

    /// Cancels the run and joins every unit, aborting the ones that outlive `join_timeout`.
    pub(crate) async fn shutdown(mut self, shared: &FarmShared, join_timeout: Duration) {
        self.run_token.cancel();

        let mut units: Vec<(String, JoinHandle<()>)> = Vec::new();
        if let Some(handle) = self.dispatch_handle.take() {
            units.push(("dispatch loop".to_string(), handle));
        }
        if let Some(handle) = self.stats_handle.take() {
            units.push(("stats aggregator".to_string(), handle));
        }
        for (device_id, handle) in shared.supervisors.drain() {
            units.push((format!("supervisor {device_id}"), handle));
        }

        for (unit, handle) in units {
            join_bounded(&unit, handle, join_timeout).await;
        }
    }

    /// Cancels the run and aborts every unit without waiting.
    pub(crate) fn abort(mut self, shared: &FarmShared) {
        self.run_token.cancel();
        if let Some(handle) = self.dispatch_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.stats_handle.take() {
            handle.abort();
        }
        shared.supervisors.abort_all();
    }
}

async fn join_bounded(unit: &str, handle: JoinHandle<()>, join_timeout: Duration) {
    let abort = handle.abort_handle();
    match timeout(join_timeout, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.is_cancelled() => {}
        Ok(Err(err)) => {
            tracing::warn!(unit, error = %err, "background task panicked");
        }
        Err(_) => {
            tracing::warn!(
                unit,
                timeout_ms = join_timeout.as_millis() as u64,
                "background task did not stop in time; aborting"
            );
            abort.abort();
        }
    }
}
