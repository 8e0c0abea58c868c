//! The top-level agent: scenario registry and the perceive -> classify ->
//! dispatch -> act -> update-memory loop.

pub mod r#loop;
pub mod scenario;

pub use r#loop::{Agent, AgentDeps, TickOutcome};
pub use scenario::{ScenarioPolicy, ScenarioRegistry};
