pub mod baton_config;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod gates;
pub mod handoff;
pub mod orchestrator;
pub mod phase;
pub mod task;
pub mod telemetry;
pub mod util;
pub mod workspace;
