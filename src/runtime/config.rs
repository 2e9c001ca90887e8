use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_DISPATCH_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_DISPATCH_ERROR_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_ROTATION_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_SESSION_DURATION_SECS: u64 = 3600;

/// Timing configuration for the farm's background units.
///
/// All instances must be constructed via [`FarmConfig::builder`] or [`FarmConfig::new`]
/// so invariants are validated before any background unit observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FarmConfig {
    dispatch_interval: Duration,
    dispatch_error_backoff: Duration,
    health_check_interval: Duration,
    stats_interval: Duration,
    rotation_poll_interval: Duration,
    shutdown_timeout: Duration,
    status_timeout: Duration,
}

pub struct FarmConfigParams {
    pub dispatch_interval: Duration,
    pub dispatch_error_backoff: Duration,
    pub health_check_interval: Duration,
    pub stats_interval: Duration,
    pub rotation_poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub status_timeout: Duration,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: DEFAULT_DISPATCH_INTERVAL,
            dispatch_error_backoff: DEFAULT_DISPATCH_ERROR_BACKOFF,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            stats_interval: DEFAULT_STATS_INTERVAL,
            rotation_poll_interval: DEFAULT_ROTATION_POLL_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            status_timeout: DEFAULT_STATUS_TIMEOUT,
        }
    }
}

impl FarmConfig {
    /// Returns a builder seeded with the production defaults.
    pub fn builder() -> FarmConfigBuilder {
        FarmConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values and validates it.
    pub fn new(params: FarmConfigParams) -> Result<Self> {
        let FarmConfigParams {
            dispatch_interval,
            dispatch_error_backoff,
            health_check_interval,
            stats_interval,
            rotation_poll_interval,
            shutdown_timeout,
            status_timeout,
        } = params;

        let config = Self {
            dispatch_interval,
            dispatch_error_backoff,
            health_check_interval,
            stats_interval,
            rotation_poll_interval,
            shutdown_timeout,
            status_timeout,
        };

        config.validate()?;
        Ok(config)
    }

    /// Pause between two dispatch loop iterations.
    pub fn dispatch_interval(&self) -> Duration {
        self.dispatch_interval
    }

    /// Pause applied after a dispatch iteration failed.
    pub fn dispatch_error_backoff(&self) -> Duration {
        self.dispatch_error_backoff
    }

    /// Pause between two health checks of an active device.
    pub fn health_check_interval(&self) -> Duration {
        self.health_check_interval
    }

    /// Cadence of the stats aggregator.
    pub fn stats_interval(&self) -> Duration {
        self.stats_interval
    }

    /// Cadence at which the rotation engine checks for finished sessions.
    pub fn rotation_poll_interval(&self) -> Duration {
        self.rotation_poll_interval
    }

    /// Upper bound for joining background units and for each executor stop call.
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Upper bound for a single device status read.
    pub fn status_timeout(&self) -> Duration {
        self.status_timeout
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("dispatch_interval", self.dispatch_interval),
            ("dispatch_error_backoff", self.dispatch_error_backoff),
            ("health_check_interval", self.health_check_interval),
            ("stats_interval", self.stats_interval),
            ("rotation_poll_interval", self.rotation_poll_interval),
            ("shutdown_timeout", self.shutdown_timeout),
            ("status_timeout", self.status_timeout),
        ];
        for (field, value) in intervals {
            if value.is_zero() {
                bail!("{field} must be greater than 0");
            }
        }

        if self.dispatch_error_backoff < self.dispatch_interval {
            bail!(
                "dispatch_error_backoff ({:?}) must be at least dispatch_interval ({:?})",
                self.dispatch_error_backoff,
                self.dispatch_interval,
            );
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct FarmConfigBuilder {
    dispatch_interval: Option<Duration>,
    dispatch_error_backoff: Option<Duration>,
    health_check_interval: Option<Duration>,
    stats_interval: Option<Duration>,
    rotation_poll_interval: Option<Duration>,
    shutdown_timeout: Option<Duration>,
    status_timeout: Option<Duration>,
}

impl FarmConfigBuilder {
    pub fn dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = Some(interval);
        self
    }

    pub fn dispatch_error_backoff(mut self, backoff: Duration) -> Self {
        self.dispatch_error_backoff = Some(backoff);
        self
    }

    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = Some(interval);
        self
    }

    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = Some(interval);
        self
    }

    pub fn rotation_poll_interval(mut self, interval: Duration) -> Self {
        self.rotation_poll_interval = Some(interval);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    pub fn status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<FarmConfig> {
        let dispatch_interval = self.dispatch_interval.unwrap_or(DEFAULT_DISPATCH_INTERVAL);
        // An unset backoff follows a shortened dispatch interval so that
        // tightening only the interval still yields a valid configuration.
        let dispatch_error_backoff = self
            .dispatch_error_backoff
            .unwrap_or_else(|| DEFAULT_DISPATCH_ERROR_BACKOFF.max(dispatch_interval));

        FarmConfig::new(FarmConfigParams {
            dispatch_interval,
            dispatch_error_backoff,
            health_check_interval: self
                .health_check_interval
                .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL),
            stats_interval: self.stats_interval.unwrap_or(DEFAULT_STATS_INTERVAL),
            rotation_poll_interval: self
                .rotation_poll_interval
                .unwrap_or(DEFAULT_ROTATION_POLL_INTERVAL),
            shutdown_timeout: self.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
            status_timeout: self.status_timeout.unwrap_or(DEFAULT_STATUS_TIMEOUT),
        })
    }
}

/// Account a device (or a rotated task) signs in with.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(alias = "email")]
    pub account: String,
    #[serde(alias = "password", skip_serializing, default)]
    pub secret: String,
}

impl Credential {
    pub fn new(account: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("account", &self.account)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Per-device settings supplied by the caller at `start` time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub max_session_duration_secs: u64,
    #[serde(alias = "save_session")]
    pub persist_session: bool,
    #[serde(alias = "google_account")]
    pub credential: Option<Credential>,
    /// Executor variant hint consumed by the [`ExecutorFactory`](crate::ExecutorFactory).
    pub executor: Option<String>,
    /// Executor-specific settings passed through untouched.
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            max_session_duration_secs: DEFAULT_MAX_SESSION_DURATION_SECS,
            persist_session: true,
            credential: None,
            executor: None,
            settings: serde_json::Map::new(),
        }
    }
}

impl DeviceConfig {
    pub fn max_session_duration(&self) -> Duration {
        Duration::from_secs(self.max_session_duration_secs)
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = Some(executor.into());
        self
    }
}
