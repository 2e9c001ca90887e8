use crate::error::FarmError;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lifecycle state of the whole farm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FarmState {
    NotRunning,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug)]
struct StateInner {
    state: FarmState,
    startup_complete: bool,
    epoch: u64,
}

/// Guards farm state transitions.
///
/// The lock is only held for the transition itself, never across an `.await`.
/// Every forced cleanup bumps the epoch so an in-flight start can notice it
/// was superseded.
#[derive(Debug)]
pub(crate) struct FarmStateMachine {
    inner: Mutex<StateInner>,
}

impl Default for FarmStateMachine {
    fn default() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                state: FarmState::NotRunning,
                startup_complete: false,
                epoch: 0,
            }),
        }
    }
}

impl FarmStateMachine {
    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> FarmState {
        self.lock().state
    }

    pub(crate) fn is_running(&self) -> bool {
        let inner = self.lock();
        inner.state == FarmState::Running && inner.startup_complete
    }

    /// `NotRunning -> Starting`. Returns the epoch the start belongs to.
    pub(crate) fn begin_start(&self) -> Result<u64, FarmError> {
        let mut inner = self.lock();
        if inner.state != FarmState::NotRunning {
            return Err(FarmError::AlreadyRunning);
        }
        inner.state = FarmState::Starting;
        inner.startup_complete = false;
        Ok(inner.epoch)
    }

    /// Fails when a forced cleanup happened since `begin_start`.
    pub(crate) fn ensure_current(&self, epoch: u64) -> Result<(), FarmError> {
        let inner = self.lock();
        if inner.epoch != epoch || inner.state != FarmState::Starting {
            return Err(FarmError::StartAborted);
        }
        Ok(())
    }

    /// `Starting -> Running` for the start identified by `epoch`.
    pub(crate) fn complete_start(&self, epoch: u64) -> Result<(), FarmError> {
        let mut inner = self.lock();
        if inner.epoch != epoch || inner.state != FarmState::Starting {
            return Err(FarmError::StartAborted);
        }
        inner.state = FarmState::Running;
        inner.startup_complete = true;
        Ok(())
    }

    /// `Starting -> NotRunning` after a failed start, unless a cleanup already took over.
    pub(crate) fn abort_start(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.epoch == epoch && inner.state == FarmState::Starting {
            inner.state = FarmState::NotRunning;
            inner.startup_complete = false;
        }
    }

    /// `Running -> Stopping`. Returns `false` when there is nothing to stop.
    pub(crate) fn begin_stop(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != FarmState::Running {
            return false;
        }
        inner.state = FarmState::Stopping;
        inner.startup_complete = false;
        true
    }

    /// Moves any state to `Stopping` and invalidates in-flight starts.
    /// Returns the state that was interrupted.
    pub(crate) fn begin_cleanup(&self) -> FarmState {
        let mut inner = self.lock();
        let previous = inner.state;
        inner.epoch += 1;
        inner.state = FarmState::Stopping;
        inner.startup_complete = false;
        previous
    }

    pub(crate) fn finish(&self) {
        let mut inner = self.lock();
        inner.state = FarmState::NotRunning;
        inner.startup_complete = false;
    }
}
