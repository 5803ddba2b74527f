//! Per-task session: the append-only record of agent turns.
//!
//! # Invariants
//! - `AgentMessage.sequence` is strictly increasing within a session
//! - messages are never mutated after being appended
//! - the iteration counter only moves forward, and only via
//!   [`Session::begin_iteration`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::patch::Patch;
use super::task::{Task, TaskContext, TaskId};
use crate::memory::MemoryRecord;

/// The six specialist roles in the debugging pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Planner,
    Locator,
    Coder,
    Executor,
    Critic,
    Reviewer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Locator => "locator",
            AgentRole::Coder => "coder",
            AgentRole::Executor => "executor",
            AgentRole::Critic => "critic",
            AgentRole::Reviewer => "reviewer",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Estimated risk of a plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// One step of a fix plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Target file or area the step concerns
    pub target: String,
    /// What to do there
    pub action: String,
    /// Estimated risk
    pub risk: RiskLevel,
}

/// An ordered fix plan, produced once per iteration by the planner.
///
/// Later plans supersede earlier ones; superseded plans stay in the history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
    /// Iteration that produced this plan
    pub iteration: u32,
}

/// How a sandbox process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitStatus {
    /// Process exited on its own with this code
    Exited { code: i32 },
    /// Process was killed (resource limit, timeout, or signal)
    Killed,
}

/// Pass/fail counts parsed from test runner output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub passed: u32,
    pub failed: u32,
}

/// Outcome of one sandboxed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit: ExitStatus,
    /// Captured stdout, truncated at the configured byte cap
    pub stdout: String,
    /// Captured stderr, truncated at the configured byte cap
    pub stderr: String,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// True when a CPU/memory/process/wall-clock limit was hit
    pub resource_limit_violation: bool,
    /// Structured test summary, when one could be parsed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestSummary>,
}

impl ExecutionResult {
    /// Whether this execution counts as a passing run: clean exit, no limit
    /// violation, and no failing tests in the summary (if any).
    pub fn passed(&self) -> bool {
        matches!(self.exit, ExitStatus::Exited { code: 0 })
            && !self.resource_limit_violation
            && self.tests.map(|t| t.failed == 0).unwrap_or(true)
    }
}

/// Reviewer decision on the candidate fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approve,
    RequestChanges,
}

/// Reviewer output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub verdict: ReviewVerdict,
    pub comments: String,
}

/// Payload of one agent turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentPayload {
    Plan(Plan),
    /// Locator output: files judged relevant, plus free-form notes
    Located { files: Vec<String>, notes: String },
    Patch(Patch),
    Execution(ExecutionResult),
    /// Critic feedback on a failing run
    Feedback { text: String },
    Review(Review),
    /// A retryable agent failure folded into the history (timeout, LLM
    /// error, malformed patch). Visible to the critic and coder.
    Failure { error: String },
}

/// What an agent hands back: its payload plus an optional routing hint.
///
/// Hints are advisory; the router validates them against the routing table
/// and ignores inconsistent ones.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub payload: AgentPayload,
    pub handoff_hint: Option<AgentRole>,
}

impl AgentOutput {
    pub fn new(payload: AgentPayload) -> Self {
        Self {
            payload,
            handoff_hint: None,
        }
    }

    pub fn with_hint(payload: AgentPayload, hint: AgentRole) -> Self {
        Self {
            payload,
            handoff_hint: Some(hint),
        }
    }
}

/// One recorded agent turn. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub sequence: u64,
    pub role: AgentRole,
    pub payload: AgentPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff_hint: Option<AgentRole>,
    pub timestamp: DateTime<Utc>,
}

/// Per-task accumulator of agent turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    task_id: TaskId,
    bug_report: String,
    context: TaskContext,
    messages: Vec<AgentMessage>,
    next_sequence: u64,
    /// Current fix iteration, starting at 1
    iteration: u32,
    /// Index into `messages` of the latest plan, if any
    latest_plan: Option<usize>,
    /// Index into `messages` of the latest patch, if any
    latest_patch: Option<usize>,
    /// Similar past solutions surfaced to the planner (advisory)
    advisory: Vec<MemoryRecord>,
}

impl Session {
    /// Create a fresh session for a task.
    pub fn new(task: &Task) -> Self {
        Self {
            task_id: task.id(),
            bug_report: task.bug_report().to_string(),
            context: task.context().clone(),
            messages: Vec::new(),
            next_sequence: 0,
            iteration: 1,
            latest_plan: None,
            latest_patch: None,
            advisory: Vec::new(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn bug_report(&self) -> &str {
        &self.bug_report
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn messages(&self) -> &[AgentMessage] {
        &self.messages
    }

    pub fn last_message(&self) -> Option<&AgentMessage> {
        self.messages.last()
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Enter the next fix iteration. Called by the orchestrator exactly at
    /// coder re-entry edges.
    pub fn begin_iteration(&mut self) {
        self.iteration += 1;
    }

    /// Append an agent turn, assigning the next sequence number.
    pub fn append(&mut self, role: AgentRole, output: AgentOutput) -> &AgentMessage {
        let index = self.messages.len();
        match &output.payload {
            AgentPayload::Plan(_) => self.latest_plan = Some(index),
            AgentPayload::Patch(_) => self.latest_patch = Some(index),
            _ => {}
        }
        self.messages.push(AgentMessage {
            sequence: self.next_sequence,
            role,
            payload: output.payload,
            handoff_hint: output.handoff_hint,
            timestamp: Utc::now(),
        });
        self.next_sequence += 1;
        &self.messages[index]
    }

    /// Append a retryable failure as a turn attributed to `role`.
    pub fn append_failure(&mut self, role: AgentRole, error: String) -> &AgentMessage {
        self.append(
            role,
            AgentOutput::new(AgentPayload::Failure { error }),
        )
    }

    /// The latest plan, if any iteration produced one.
    pub fn latest_plan(&self) -> Option<&Plan> {
        self.latest_plan.map(|i| match &self.messages[i].payload {
            AgentPayload::Plan(plan) => plan,
            _ => unreachable!("latest_plan index always points at a plan"),
        })
    }

    /// The latest candidate patch, if any.
    pub fn latest_patch(&self) -> Option<&Patch> {
        self.latest_patch.map(|i| match &self.messages[i].payload {
            AgentPayload::Patch(patch) => patch,
            _ => unreachable!("latest_patch index always points at a patch"),
        })
    }

    /// The most recent execution result, if any.
    pub fn latest_execution(&self) -> Option<&ExecutionResult> {
        self.messages.iter().rev().find_map(|m| match &m.payload {
            AgentPayload::Execution(result) => Some(result),
            _ => None,
        })
    }

    /// The files the locator judged relevant, most recent turn first.
    pub fn located_files(&self) -> Option<&[String]> {
        self.messages.iter().rev().find_map(|m| match &m.payload {
            AgentPayload::Located { files, .. } => Some(files.as_slice()),
            _ => None,
        })
    }

    pub fn set_advisory(&mut self, records: Vec<MemoryRecord>) {
        self.advisory = records;
    }

    pub fn advisory(&self) -> &[MemoryRecord] {
        &self.advisory
    }
}
