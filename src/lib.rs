//! autodebug: an autonomous multi-agent debugging pipeline.
//!
//! A submitted bug report is driven through six specialist agents
//! (planner, locator, coder, executor, critic, reviewer) by a deterministic
//! orchestrator. Candidate fixes are verified in a resource-limited sandbox,
//! solved tasks feed a similarity memory, and everything is observable over
//! a small HTTP API.
//!
//! Module map:
//! - [`task`] - tasks, sessions, patches: the data the pipeline operates on
//! - [`agents`] - the six specialist roles and their registry
//! - [`router`] / [`policy`] - handoff topology and termination rules
//! - [`orchestrator`] - the control loop tying the above together
//! - [`sandbox`] - isolated execution of candidate fixes
//! - [`memory`] - similarity search over past solutions
//! - [`llm`] - chat-completion client abstraction
//! - [`api`] - HTTP surface
//! - [`config`] - environment-driven configuration

pub mod agents;
pub mod api;
pub mod config;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod policy;
pub mod router;
pub mod sandbox;
pub mod task;

pub use config::Config;
pub use orchestrator::{Orchestrator, TaskRun};
