//! Decision core for the career training/racing automation bot.
//!
//! The crate closes the loop over a noisy, partially observable game UI:
//! classify the current screen from detector evidence, route it to the
//! active scenario policy, execute the policy's flow through the Waiter, and
//! keep the cross-turn memories (skills, PAL chains, planned races) honest.
//! Frame capture, input emission, detection and OCR live behind the
//! `controller` and `perception` traits; runners plug in real backends.

pub mod agent;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod date;
pub mod flows;
pub mod geometry;
pub mod memory;
pub mod perception;
pub mod screen;
pub mod stop;
pub mod style;
pub mod text;
pub mod training;
pub mod types;
pub mod waiter;

#[cfg(test)]
pub mod testkit;

pub use agent::{Agent, AgentDeps, TickOutcome};
pub use stop::{Aborted, Stalled, StopFlag};
pub use waiter::{PollConfig, Waiter};
