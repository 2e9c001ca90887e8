//! Runtime glue: configuration, collaborator traits and their in-process
//! implementations, telemetry, and the signal-aware runner.

pub mod config;
pub mod executor;
pub mod runner;
pub mod simulated;
pub mod telemetry;
