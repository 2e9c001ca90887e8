use super::config::RotationMode;
use serde::Serialize;

/// Snapshot of a rotation run as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RotationStatus {
    pub is_rotating: bool,
    pub current_loop: u32,
    pub total_loops: u32,
    pub current_account_index: usize,
    pub total_accounts: usize,
    pub mode: RotationMode,
    pub progress_percentage: f64,
}

/// `((loop - 1) * accounts + index) / (loops * accounts) * 100`, clamped to
/// `[0, 100]` and `0` when there is nothing to rotate through.
pub fn progress_percentage(
    current_loop: u32,
    total_loops: u32,
    current_account_index: usize,
    total_accounts: usize,
) -> f64 {
    if total_accounts == 0 || total_loops == 0 {
        return 0.0;
    }

    let accounts = total_accounts as f64;
    let index = current_account_index.min(total_accounts) as f64;
    let done = f64::from(current_loop.saturating_sub(1)) * accounts + index;
    let total = f64::from(total_loops) * accounts;
    (done / total * 100.0).clamp(0.0, 100.0)
}

/// Mutable rotation progress shared between the engine task and status readers.
#[derive(Debug, Clone, Default)]
pub(crate) struct RotationState {
    is_rotating: bool,
    current_loop: u32,
    total_loops: u32,
    current_account_index: usize,
    total_accounts: usize,
    mode: RotationMode,
    high_water: f64,
}

impl RotationState {
    pub(crate) fn begin(&mut self, mode: RotationMode, total_loops: u32, total_accounts: usize) {
        *self = Self {
            is_rotating: true,
            current_loop: 0,
            total_loops,
            current_account_index: 0,
            total_accounts,
            mode,
            high_water: 0.0,
        };
    }

    pub(crate) fn enter_loop(&mut self, loop_index: u32) {
        self.current_loop = loop_index;
        self.current_account_index = 0;
    }

    pub(crate) fn advance(&mut self) {
        self.current_account_index += 1;
    }

    pub(crate) fn finish(&mut self) {
        self.is_rotating = false;
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn is_rotating(&self) -> bool {
        self.is_rotating
    }

    /// Never reports less progress than an earlier call during the same run.
    pub(crate) fn status(&mut self) -> RotationStatus {
        let computed = progress_percentage(
            self.current_loop,
            self.total_loops,
            self.current_account_index,
            self.total_accounts,
        );
        self.high_water = self.high_water.max(computed);

        RotationStatus {
            is_rotating: self.is_rotating,
            current_loop: self.current_loop,
            total_loops: self.total_loops,
            current_account_index: self.current_account_index,
            total_accounts: self.total_accounts,
            mode: self.mode,
            progress_percentage: self.high_water,
        }
    }
}
