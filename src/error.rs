//! Typed failures surfaced by the farm's public operations.
//!
//! Collaborators (executors, profile stores, factories) report `anyhow`
//! errors; the orchestrator folds them into one of these kinds before
//! handing a result back to its caller.

use crate::queue::task::TaskKind;
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum FarmError {
    /// `start` was called while the farm was not `NotRunning`.
    #[error("farm is already running")]
    AlreadyRunning,

    /// A required collaborator was never provided to the orchestrator.
    #[error("{component} is not initialized")]
    NotInitialized { component: &'static str },

    /// A device could not be constructed; the whole start was rolled back.
    #[error("failed to initialize device {device_id}: {reason}")]
    DeviceInitialization { device_id: String, reason: String },

    /// A task payload is missing fields its type requires.
    #[error("invalid {kind} task: {reason}")]
    TaskValidation { kind: TaskKind, reason: String },

    /// An operation referenced a device id absent from the registry.
    #[error("device {device_id} not found")]
    DeviceNotFound { device_id: String },

    #[error("device {device_id} failed to start a session: {reason}")]
    SessionStart { device_id: String, reason: String },

    #[error("device {device_id} failed to stop its session: {reason}")]
    SessionStop { device_id: String, reason: String },

    /// A forced cleanup ran while this start was still initializing.
    #[error("farm start was interrupted by a forced cleanup")]
    StartAborted,
}

impl FarmError {
    /// Short stable label for structured logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            FarmError::AlreadyRunning => "already_running",
            FarmError::NotInitialized { .. } => "not_initialized",
            FarmError::DeviceInitialization { .. } => "device_initialization",
            FarmError::TaskValidation { .. } => "task_validation",
            FarmError::DeviceNotFound { .. } => "device_not_found",
            FarmError::SessionStart { .. } => "session_start",
            FarmError::SessionStop { .. } => "session_stop",
            FarmError::StartAborted => "start_aborted",
        }
    }
}
