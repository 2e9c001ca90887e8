pub mod error;
pub mod farm;
pub mod queue;
pub mod rotation;
pub mod runtime;

pub use error::FarmError;
pub use farm::orchestrator::{FarmOrchestrator, FarmOrchestratorBuilder, FarmStats, StopReport};
pub use farm::registry::DevicePhase;
pub use farm::state::FarmState;
pub use queue::task::{RotationMeta, Task, TaskId, TaskKind, TaskPlan, TaskRequest, TaskStatus};
pub use queue::task_queue::{TaskCounts, TaskQueue};
pub use rotation::config::{RotationConfig, RotationMode};
pub use rotation::status::{progress_percentage, RotationStatus};
pub use runtime::config::{Credential, DeviceConfig, FarmConfig, FarmConfigBuilder, FarmConfigParams};
pub use runtime::executor::{
    DeviceStatus, ExecutorFactory, ExecutorFuture, Profile, ProfileStore, SessionExecutor,
};
pub use runtime::runner::{FarmRunner, RunPlan};
pub use runtime::simulated::{
    InMemoryProfileStore, SimulatedDurations, SimulatedExecutor, SimulatedExecutorFactory,
};
pub use runtime::telemetry::{init_tracing, EngagementLedger, FarmStatsSnapshot, FarmTelemetry};
