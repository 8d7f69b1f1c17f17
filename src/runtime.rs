//! Runtime glue that wires configs, fatal-error propagation, stall
//! detection, telemetry, and runner orchestration.

pub mod config;
pub mod fatal;
pub mod runner;
pub mod stall;
pub mod telemetry;
