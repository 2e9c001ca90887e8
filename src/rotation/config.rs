use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const DEFAULT_LOOPS: u32 = 1;
const DEFAULT_MAX_CONCURRENT_DEVICES: usize = 1;

/// How the tasks of one rotation loop are spread over devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationMode {
    /// One task at a time, each awaited before the next.
    #[default]
    Sequential,
    /// Per-device task lists, a bounded number of devices at once.
    Batch,
    /// Round robin over the first devices without waiting for each other.
    Concurrent,
}

impl fmt::Display for RotationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RotationMode::Sequential => "sequential",
            RotationMode::Batch => "batch",
            RotationMode::Concurrent => "concurrent",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub mode: RotationMode,
    pub loops: u32,
    pub total_accounts: usize,
    #[serde(with = "duration_secs")]
    pub delay_between_accounts: Duration,
    pub max_concurrent_devices: usize,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            mode: RotationMode::default(),
            loops: DEFAULT_LOOPS,
            total_accounts: 0,
            delay_between_accounts: Duration::ZERO,
            max_concurrent_devices: DEFAULT_MAX_CONCURRENT_DEVICES,
        }
    }
}

impl RotationConfig {
    pub fn new(mode: RotationMode, loops: u32, total_accounts: usize) -> Self {
        Self {
            mode,
            loops,
            total_accounts,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_between_accounts = delay;
        self
    }

    pub fn with_max_concurrent_devices(mut self, devices: usize) -> Self {
        self.max_concurrent_devices = devices;
        self
    }

    /// Clamps values the engine cannot run with: at least one concurrent device.
    pub fn normalized(mut self) -> Self {
        if self.max_concurrent_devices == 0 {
            tracing::warn!("max_concurrent_devices of 0 raised to 1");
            self.max_concurrent_devices = 1;
        }
        self
    }
}

/// Serializes a [`Duration`] as fractional seconds.
mod duration_secs {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
    }
}
