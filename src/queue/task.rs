//! Task records and the request shape callers submit.

use crate::error::FarmError;
use crate::runtime::config::Credential;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

const TASK_ID_PREFIX: &str = "task_";

/// Identifier of a task, rendered as `task_<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub(crate) fn from_sequence(sequence: u64) -> Self {
        Self(format!("{TASK_ID_PREFIX}{sequence}"))
    }

    /// Numeric suffix for ids of the form `task_<n>`.
    pub fn sequence(&self) -> Option<u64> {
        self.0.strip_prefix(TASK_ID_PREFIX)?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    #[serde(
        alias = "engagement_search",
        alias = "enhanced_search",
        alias = "search_engine"
    )]
    EngagementSearch,
    #[serde(alias = "video_watch", alias = "youtube")]
    VideoWatch,
    #[serde(alias = "site_visit", alias = "website_visit")]
    SiteVisit,
    #[serde(alias = "generic_browse", alias = "browsing")]
    GenericBrowse,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::EngagementSearch => "engagement-search",
            TaskKind::VideoWatch => "video-watch",
            TaskKind::SiteVisit => "site-visit",
            TaskKind::GenericBrowse => "generic-browse",
        }
    }

    /// Payload field that must hold a non-empty list for this kind, if any.
    pub fn required_list(&self) -> Option<&'static str> {
        match self {
            TaskKind::EngagementSearch => Some("keywords"),
            TaskKind::VideoWatch => Some("video_urls"),
            TaskKind::SiteVisit => Some("urls"),
            TaskKind::GenericBrowse => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Placement of a task inside an account rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationMeta {
    #[serde(rename = "loop", default = "first_loop")]
    pub loop_index: u32,
    #[serde(default)]
    pub account_index: usize,
    /// Device the task was planned for; absent means "pick by account index".
    #[serde(default)]
    pub device_id: Option<String>,
}

fn first_loop() -> u32 {
    1
}

impl RotationMeta {
    pub fn new(loop_index: u32, account_index: usize) -> Self {
        Self {
            loop_index,
            account_index,
            device_id: None,
        }
    }

    pub fn on_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

/// A task as submitted by a caller, before the queue assigns it an id and a status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<RotationMeta>,
    #[serde(
        default,
        alias = "google_account",
        skip_serializing_if = "Option::is_none"
    )]
    pub assigned_account: Option<Credential>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl TaskRequest {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            id: None,
            kind,
            rotation: None,
            assigned_account: None,
            payload: Map::new(),
        }
    }

    /// Decodes a JSON task description such as `{"type": "youtube", "video_urls": [...]}`.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).context("failed to decode task request")
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_rotation(mut self, rotation: RotationMeta) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_account(mut self, credential: Credential) -> Self {
        self.assigned_account = Some(credential);
        self
    }

    /// Checks that the payload carries the list its kind needs.
    pub fn validate(&self) -> Result<(), FarmError> {
        let Some(field) = self.kind.required_list() else {
            return Ok(());
        };

        if string_list(self.payload.get(field)).is_empty() {
            return Err(FarmError::TaskValidation {
                kind: self.kind,
                reason: format!("{field} must be a non-empty list"),
            });
        }
        Ok(())
    }
}

/// A task held by the queue or handed to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<RotationMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_account: Option<Credential>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn pending(id: TaskId, request: TaskRequest) -> Self {
        Self {
            id,
            kind: request.kind,
            status: TaskStatus::Pending,
            payload: request.payload,
            rotation: request.rotation,
            assigned_account: request.assigned_account,
            created_at: Utc::now(),
            assigned_at: None,
        }
    }

    /// Rotation loop this task belongs to; tasks without metadata run in loop 1.
    pub fn loop_index(&self) -> u32 {
        self.rotation.as_ref().map_or(1, |meta| meta.loop_index)
    }

    pub fn account_index(&self) -> usize {
        self.rotation.as_ref().map_or(0, |meta| meta.account_index)
    }

    pub fn designated_device(&self) -> Option<&str> {
        self.rotation.as_ref()?.device_id.as_deref()
    }

    /// Items listed under `field`, accepting a bare string as a single item.
    pub fn list(&self, field: &str) -> Vec<String> {
        string_list(self.payload.get(field))
    }
}

pub(crate) fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(item)) if !item.trim().is_empty() => vec![item.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str())
            .filter(|item| !item.trim().is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Collection of tasks supplied at farm start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    #[serde(default)]
    pub tasks: Vec<TaskRequest>,
}

impl TaskPlan {
    pub fn new(tasks: Vec<TaskRequest>) -> Self {
        Self { tasks }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).context("failed to decode task plan")
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
