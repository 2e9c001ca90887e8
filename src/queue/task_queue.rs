use super::task::{Task, TaskId, TaskRequest, TaskStatus};
use crate::error::FarmError;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

const FIRST_TASK_SEQUENCE: u64 = 1;

/// Per-status tallies of the queue contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    /// Tasks handed to a device that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.assigned + self.running
    }

    pub fn total(&self) -> usize {
        self.pending + self.assigned + self.running + self.completed + self.failed
    }
}

/// Insertion-ordered store of tasks keyed by id.
///
/// Ids come from a counter that only moves forward until [`TaskQueue::reset`].
/// Every operation takes the inner lock for a short, synchronous critical section.
#[derive(Debug)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
}

#[derive(Debug)]
struct QueueInner {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    next_sequence: u64,
}

impl QueueInner {
    fn allocate_id(&mut self) -> TaskId {
        let id = TaskId::from_sequence(self.next_sequence);
        self.next_sequence += 1;
        id
    }

    /// Picks the id for `request`, honouring an explicit one and moving the
    /// counter past it so later allocations never collide.
    fn claim_id(&mut self, request: &TaskRequest) -> TaskId {
        match &request.id {
            Some(id) => {
                if let Some(sequence) = id.sequence() {
                    self.next_sequence = self.next_sequence.max(sequence.saturating_add(1));
                }
                id.clone()
            }
            None => self.allocate_id(),
        }
    }

    fn push(&mut self, task: Task) {
        self.index.insert(task.id.clone(), self.tasks.len());
        self.tasks.push(task);
    }

    fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let position = *self.index.get(id)?;
        self.tasks.get_mut(position)
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tasks: Vec::new(),
                index: HashMap::new(),
                next_sequence: FIRST_TASK_SEQUENCE,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the queue contents with `requests`, all of them `pending`.
    ///
    /// Returns the number of tasks stored; duplicate ids are skipped.
    pub fn load(&self, requests: Vec<TaskRequest>) -> usize {
        let mut inner = self.lock();
        inner.tasks.clear();
        inner.index.clear();

        for request in requests {
            let id = inner.claim_id(&request);
            if inner.index.contains_key(&id) {
                tracing::warn!(task = %id, "duplicate task id in plan; skipping");
                continue;
            }
            inner.push(Task::pending(id, request));
        }

        let loaded = inner.tasks.len();
        tracing::info!(tasks = loaded, "task queue loaded");
        loaded
    }

    /// Turns `requests` into pending tasks with ids from this queue's counter
    /// without storing them.
    pub fn materialize(&self, requests: Vec<TaskRequest>) -> Vec<Task> {
        let mut inner = self.lock();
        requests
            .into_iter()
            .map(|request| {
                let id = inner.claim_id(&request);
                Task::pending(id, request)
            })
            .collect()
    }

    /// Validates and appends a task, returning its freshly allocated id.
    pub fn add_task(&self, mut request: TaskRequest) -> Result<TaskId, FarmError> {
        request.validate()?;
        // Callers never choose ids for added tasks.
        request.id = None;

        let mut inner = self.lock();
        let id = inner.allocate_id();
        inner.push(Task::pending(id.clone(), request));
        tracing::info!(task = %id, "task added");
        Ok(id)
    }

    /// Pending tasks in insertion order.
    pub fn pending_tasks(&self) -> Vec<Task> {
        self.lock()
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Pending)
            .cloned()
            .collect()
    }

    /// First `limit` pending tasks in insertion order.
    pub fn next_pending(&self, limit: usize) -> Vec<Task> {
        if limit == 0 {
            return Vec::new();
        }
        self.lock()
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Pending)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn mark_assigned(&self, id: &TaskId) -> bool {
        self.transition(id, TaskStatus::Assigned)
    }

    pub fn mark_running(&self, id: &TaskId) -> bool {
        self.transition(id, TaskStatus::Running)
    }

    pub fn mark_completed(&self, id: &TaskId) -> bool {
        self.transition(id, TaskStatus::Completed)
    }

    pub fn mark_failed(&self, id: &TaskId) -> bool {
        self.transition(id, TaskStatus::Failed)
    }

    fn transition(&self, id: &TaskId, status: TaskStatus) -> bool {
        let mut inner = self.lock();
        let Some(task) = inner.get_mut(id) else {
            tracing::warn!(task = %id, status = ?status, "status change for unknown task");
            return false;
        };

        if task.status.is_terminal() {
            tracing::debug!(
                task = %id,
                current = ?task.status,
                requested = ?status,
                "ignoring status change for finished task"
            );
            return false;
        }

        if status == TaskStatus::Assigned {
            task.assigned_at = Some(Utc::now());
        }
        task.status = status;
        true
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        let inner = self.lock();
        let position = *inner.index.get(id)?;
        inner.tasks.get(position).cloned()
    }

    /// Snapshot of every task in insertion order.
    pub fn tasks(&self) -> Vec<Task> {
        self.lock().tasks.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().tasks.is_empty()
    }

    pub fn counts(&self) -> TaskCounts {
        let inner = self.lock();
        let mut counts = TaskCounts::default();
        for task in &inner.tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Assigned => counts.assigned += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Drops every task but keeps the id counter.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.tasks.clear();
        inner.index.clear();
    }

    /// Drops every task and restarts ids at `task_1`.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.tasks.clear();
        inner.index.clear();
        inner.next_sequence = FIRST_TASK_SEQUENCE;
    }
}
