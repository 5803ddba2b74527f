//! Task definitions and per-task session history.
//!
//! A [`Task`] is the externally visible unit of work (one bug report); a
//! [`Session`] is its append-only history of agent turns. The task status is
//! the only externally mutable field, and only through the explicit
//! transition methods.

mod patch;
mod session;
mod task;

pub use patch::{Patch, PatchChange, PatchError};
pub use session::{
    AgentMessage, AgentOutput, AgentPayload, AgentRole, ExecutionResult, ExitStatus, Plan,
    PlanStep, Review, ReviewVerdict, RiskLevel, Session, TestSummary,
};
pub use task::{Task, TaskContext, TaskError, TaskId, TaskStatus};
