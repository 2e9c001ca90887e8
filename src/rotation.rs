//! Account rotation across loops in sequential, batch or concurrent mode.

pub mod config;
pub(crate) mod engine;
pub mod status;
