//! Core Task type with lifecycle state machine.
//!
//! # Invariants
//! - `id` is unique within the process
//! - immutable fields (`bug_report`, `context`, `created_at`) never change
//!   after construction; `status` mutates only via explicit transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Structured context accompanying a bug report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskContext {
    /// Programming language hint (e.g. "python", "rust")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Framework hint (e.g. "django", "axum")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,

    /// Test command override; detected from the workspace when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,

    /// Path to the source tree the fix applies to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<std::path::PathBuf>,
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> Running -> Succeeded
///                   \-> Failed
///        \-> Cancelled
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is waiting to be executed
    Pending,
    /// Task is currently being executed
    Running,
    /// A fix was produced and approved
    Succeeded,
    /// Task failed with a reason
    Failed { reason: String },
    /// Task was cancelled before completion
    Cancelled,
}

impl TaskStatus {
    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }

    /// Check if the task is still active (can make progress).
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// A debugging task: one bug report to diagnose and fix.
///
/// Owned exclusively by the orchestrator while running; the API layer sees
/// snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    bug_report: String,
    context: TaskContext,
    created_at: DateTime<Utc>,
    status: TaskStatus,
}

impl Task {
    /// Create a new task with `status == Pending`.
    ///
    /// # Errors
    /// Returns `Err` if the bug report is empty.
    pub fn new(bug_report: String, context: TaskContext) -> Result<Self, TaskError> {
        if bug_report.trim().is_empty() {
            return Err(TaskError::EmptyBugReport);
        }

        Ok(Self {
            id: TaskId::new(),
            bug_report,
            context,
            created_at: Utc::now(),
            status: TaskStatus::Pending,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn bug_report(&self) -> &str {
        &self.bug_report
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    // State transitions - explicit and validated

    /// Transition the task to Running state.
    ///
    /// # Precondition
    /// `self.status == Pending`
    pub fn start(&mut self) -> Result<(), TaskError> {
        match &self.status {
            TaskStatus::Pending => {
                self.status = TaskStatus::Running;
                Ok(())
            }
            other => Err(TaskError::InvalidTransition {
                from: format!("{:?}", other),
                to: "Running".to_string(),
            }),
        }
    }

    /// Transition the task to Succeeded state.
    ///
    /// # Precondition
    /// `self.status == Running`
    pub fn succeed(&mut self) -> Result<(), TaskError> {
        match &self.status {
            TaskStatus::Running => {
                self.status = TaskStatus::Succeeded;
                Ok(())
            }
            other => Err(TaskError::InvalidTransition {
                from: format!("{:?}", other),
                to: "Succeeded".to_string(),
            }),
        }
    }

    /// Transition the task to Failed state.
    ///
    /// # Precondition
    /// `self.status == Running`
    pub fn fail(&mut self, reason: String) -> Result<(), TaskError> {
        match &self.status {
            TaskStatus::Running => {
                self.status = TaskStatus::Failed { reason };
                Ok(())
            }
            other => Err(TaskError::InvalidTransition {
                from: format!("{:?}", other),
                to: "Failed".to_string(),
            }),
        }
    }

    /// Transition the task to Cancelled state.
    ///
    /// # Precondition
    /// `self.status.is_active()`
    pub fn cancel(&mut self) -> Result<(), TaskError> {
        if self.status.is_active() {
            self.status = TaskStatus::Cancelled;
            Ok(())
        } else {
            Err(TaskError::InvalidTransition {
                from: format!("{:?}", self.status),
                to: "Cancelled".to_string(),
            })
        }
    }
}

/// Errors that can occur during task operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("Bug report cannot be empty")]
    EmptyBugReport,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}
