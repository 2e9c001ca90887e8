//! Collaborator seams: the session executor, the factory choosing one per
//! device, and the profile store.

use crate::queue::task::Task;
use crate::runtime::config::{Credential, DeviceConfig};
use anyhow::Result;
use chrono::{DateTime, Utc};
use core::future::Future;
use core::pin::Pin;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type ExecutorFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Credential-bearing handle a session runs under.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    pub device_id: String,
    /// Where the store keeps this profile's data.
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub credential: Option<Credential>,
}

impl Profile {
    pub fn new(device_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            location: location.into(),
            created_at: Utc::now(),
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }
}

/// Point-in-time view of a device's session as reported by its executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub is_active: bool,
    pub login_success: bool,
    pub current_task: Option<Task>,
    pub session_duration_secs: u64,
    pub executor: String,
    /// Engagement counters for the current or last session, e.g. `searches_performed`.
    pub metrics: BTreeMap<String, u64>,
}

impl DeviceStatus {
    /// Placeholder returned when an executor cannot report its status.
    pub fn unavailable(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            executor: "unknown".to_string(),
            ..Self::default()
        }
    }
}

/// Drives one device's automated sessions.
///
/// Implementations own their session state; the farm only observes it through
/// [`is_active`](SessionExecutor::is_active) and
/// [`status`](SessionExecutor::status). `start_session` returns `Ok(false)`
/// when the executor declined the session without an error.
pub trait SessionExecutor: Send + Sync + 'static {
    /// Short name of the executor variant for logs and status reports.
    fn kind(&self) -> &'static str;

    fn start_session(&self, profile: Profile, task: Task) -> ExecutorFuture<'_, Result<bool>>;

    fn stop_session(&self) -> ExecutorFuture<'_, Result<()>>;

    fn is_active(&self) -> bool;

    fn is_healthy(&self) -> ExecutorFuture<'_, bool>;

    fn status(&self) -> ExecutorFuture<'_, Result<DeviceStatus>>;

    /// In-place restart of the current session, when the executor supports one.
    ///
    /// Returning `None` makes the supervisor fall back to stop followed by start.
    fn restart_session(&self) -> Option<ExecutorFuture<'_, Result<bool>>> {
        None
    }
}

/// Chooses and builds the executor for a device. Called once per device at farm start.
pub trait ExecutorFactory: Send + Sync + 'static {
    fn create(&self, device_id: &str, config: &DeviceConfig) -> Result<Arc<dyn SessionExecutor>>;
}

pub trait ProfileStore: Send + Sync + 'static {
    fn create_profile<'a>(&'a self, device_id: &'a str) -> ExecutorFuture<'a, Result<Profile>>;
}
