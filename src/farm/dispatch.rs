use super::backoff::{panic_message, pause};
use super::shared::{FarmShared, TaskOrigin};
use anyhow::Result;
use futures::FutureExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of one dispatch iteration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DispatchReport {
    pub available: usize,
    pub assigned: usize,
    pub rejected: usize,
    pub orphaned: usize,
}

/// Spawns the queue-driven dispatch loop.
///
/// Each iteration pairs available devices with pending tasks in queue order.
/// An iteration that errors or panics is logged and followed by the longer
/// error backoff; the loop itself only ends on cancellation.
pub(crate) fn spawn_dispatch_loop(shared: Arc<FarmShared>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = shared.config.dispatch_interval();
        let error_backoff = shared.config.dispatch_error_backoff();

        loop {
            if token.is_cancelled() {
                break;
            }

            let outcome = std::panic::AssertUnwindSafe(dispatch_once(&shared, &token))
                .catch_unwind()
                .await;

            let delay = match outcome {
                Ok(Ok(report)) => {
                    if report.assigned > 0 || report.orphaned > 0 {
                        tracing::debug!(
                            target: "farmhand::dispatch",
                            available = report.available,
                            assigned = report.assigned,
                            rejected = report.rejected,
                            orphaned = report.orphaned,
                            "dispatch iteration finished"
                        );
                    }
                    interval
                }
                Ok(Err(err)) => {
                    tracing::error!(target: "farmhand::dispatch", error = %err, "dispatch iteration failed");
                    error_backoff
                }
                Err(panic_payload) => {
                    tracing::error!(
                        target: "farmhand::dispatch",
                        panic = %panic_message(panic_payload.as_ref()),
                        "dispatch iteration panicked"
                    );
                    error_backoff
                }
            };

            if !pause(delay, &token).await {
                break;
            }
        }

        tracing::debug!(target: "farmhand::dispatch", "dispatch loop stopped");
    })
}

pub(crate) async fn dispatch_once(
    shared: &Arc<FarmShared>,
    token: &CancellationToken,
) -> Result<DispatchReport> {
    let mut report = DispatchReport {
        orphaned: shared.sweep_orphaned(),
        ..DispatchReport::default()
    };

    let available = shared.registry.available();
    report.available = available.len();
    if available.is_empty() {
        return Ok(report);
    }

    let tasks = shared.queue.next_pending(available.len());
    for (device, task) in available.iter().zip(tasks) {
        if token.is_cancelled() {
            break;
        }
        if shared
            .start_device(device.id(), task, TaskOrigin::Queue, token)
            .await
        {
            report.assigned += 1;
        } else {
            report.rejected += 1;
        }
    }

    Ok(report)
}
