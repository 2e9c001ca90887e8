//! Device slots owned by the farm for the duration of one run.

use crate::runtime::config::{Credential, DeviceConfig};
use crate::runtime::executor::SessionExecutor;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Lifecycle phase of a device slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePhase {
    Idle,
    Starting,
    Active,
    Unhealthy,
    Restarting,
    Stopped,
}

pub struct Device {
    id: String,
    config: Mutex<DeviceConfig>,
    executor: Arc<dyn SessionExecutor>,
    session_active: AtomicBool,
    phase: Mutex<DevicePhase>,
    session: AtomicU64,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("executor", &self.executor.kind())
            .field("session_active", &self.in_session())
            .field("phase", &self.phase())
            .finish()
    }
}

impl Device {
    pub fn new(id: impl Into<String>, config: DeviceConfig, executor: Arc<dyn SessionExecutor>) -> Self {
        Self {
            id: id.into(),
            config: Mutex::new(config),
            executor,
            session_active: AtomicBool::new(false),
            phase: Mutex::new(DevicePhase::Idle),
            session: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn executor(&self) -> Arc<dyn SessionExecutor> {
        Arc::clone(&self.executor)
    }

    pub fn config(&self) -> DeviceConfig {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the credential the next session signs in with.
    pub fn attach_credential(&self, credential: Credential) {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .credential = Some(credential);
    }

    fn phase_guard(&self) -> MutexGuard<'_, DevicePhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> DevicePhase {
        *self.phase_guard()
    }

    pub fn set_phase(&self, phase: DevicePhase) {
        *self.phase_guard() = phase;
    }

    /// Moves to `to` only while the device is in phase `from`.
    pub fn transition(&self, from: DevicePhase, to: DevicePhase) -> bool {
        let mut phase = self.phase_guard();
        if *phase != from {
            return false;
        }
        *phase = to;
        true
    }

    /// Takes the device for a new session. Fails when another session holds it.
    pub fn try_claim(&self) -> bool {
        let claimed = self
            .session_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            self.set_phase(DevicePhase::Starting);
        }
        claimed
    }

    /// Clears the liveness flag. Only the caller that observed it set gets `true`.
    pub fn release(&self) -> bool {
        let was_active = self.session_active.swap(false, Ordering::AcqRel);
        if was_active {
            let mut phase = self.phase_guard();
            if *phase != DevicePhase::Stopped {
                *phase = DevicePhase::Idle;
            }
        }
        was_active
    }

    pub fn in_session(&self) -> bool {
        self.session_active.load(Ordering::Acquire)
    }

    /// Free for dispatch: no session holds it and it is not mid start or restart.
    pub fn is_available(&self) -> bool {
        !self.in_session()
            && !matches!(
                self.phase(),
                DevicePhase::Starting | DevicePhase::Restarting | DevicePhase::Stopped
            )
    }

    pub(crate) fn begin_session(&self, session: u64) {
        self.session.store(session, Ordering::Release);
    }

    /// Number of the current (or last) session on this device, `0` before the first one.
    pub fn session_id(&self) -> u64 {
        self.session.load(Ordering::Acquire)
    }
}

/// Insertion-ordered set of devices, rebuilt on every farm start.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<Vec<Arc<Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, devices: Vec<Arc<Device>>) {
        *self.devices.write().unwrap_or_else(PoisonError::into_inner) = devices;
    }

    pub fn clear(&self) {
        self.devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Clones the current device list out of the lock.
    pub fn snapshot(&self) -> Vec<Arc<Device>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|device| device.id() == device_id)
            .cloned()
    }

    pub fn available(&self) -> Vec<Arc<Device>> {
        self.snapshot()
            .into_iter()
            .filter(|device| device.is_available())
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|device| device.id().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Id of the `index`-th configured device (0-based), rendered 1-based.
pub fn device_id_for(index: usize) -> String {
    format!("device_{}", index + 1)
}
