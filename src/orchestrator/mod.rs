//! Per-role orchestrators (C12/C13): the lifecycle glue wiring every other
//! component into one running node.

pub mod agent;
pub mod overwatch;

pub use agent::AgentOrchestrator;
pub use overwatch::OverwatchOrchestrator;
