use crate::error::FarmError;
use crate::farm::orchestrator::{FarmOrchestrator, StopReport};
use crate::queue::task::TaskPlan;
use crate::rotation::config::RotationConfig;
use crate::runtime::config::DeviceConfig;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// What a [`FarmRunner`] starts.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    pub devices: Vec<DeviceConfig>,
    pub tasks: TaskPlan,
    /// Schedules the tasks through the rotation engine instead of the queue.
    pub rotation: Option<RotationConfig>,
}

/// Drives a farm run and handles OS signals for graceful shutdowns.
pub struct FarmRunner {
    orchestrator: Arc<FarmOrchestrator>,
    shutdown: CancellationToken,
}

impl FarmRunner {
    /// Wires a fresh root [`CancellationToken`] into `orchestrator`.
    pub fn new(orchestrator: Arc<FarmOrchestrator>) -> Self {
        let shutdown = CancellationToken::new();
        orchestrator.replace_shutdown_root(shutdown.clone());
        Self {
            orchestrator,
            shutdown,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn orchestrator(&self) -> Arc<FarmOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub async fn start(&self, plan: RunPlan) -> Result<(), FarmError> {
        let RunPlan {
            devices,
            tasks,
            rotation,
        } = plan;
        match rotation {
            Some(rotation) => {
                self.orchestrator
                    .start_with_rotation(devices, tasks, rotation)
                    .await
            }
            None => self.orchestrator.start(devices, tasks).await,
        }
    }

    /// Stops the farm and re-arms the root token for the next run.
    pub async fn stop(&mut self) -> StopReport {
        self.shutdown.cancel();
        let report = self.orchestrator.stop().await;
        self.reinitialize_shutdown_token();
        report
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&mut self, plan: RunPlan) -> Result<StopReport, FarmError> {
        self.start(plan).await?;
        tracing::info!("farm runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down farm");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("farm runner shutdown token cancelled");
            }
        }

        Ok(self.stop().await)
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
        self.orchestrator
            .replace_shutdown_root(self.shutdown.clone());
    }
}
