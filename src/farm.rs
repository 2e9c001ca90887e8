//! Farm lifecycle: the device registry, the dispatch loop, per-session
//! supervisors and the orchestrator that ties them together.

pub(crate) mod backoff;
pub(crate) mod dispatch;
pub(crate) mod lifecycle;
pub mod orchestrator;
pub mod registry;
pub(crate) mod shared;
pub mod state;
pub(crate) mod supervisor;
