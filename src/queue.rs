//! Task records and the insertion-ordered queue the dispatch loop drains.

pub mod task;
pub mod task_queue;
