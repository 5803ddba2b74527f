//! The specialist agents of the debugging pipeline.
//!
//! Five roles are LLM-backed (planner, locator, coder, critic, reviewer);
//! the executor runs the sandbox and uses no model. Every agent implements
//! [`Agent`]: it reads the session, produces one [`AgentOutput`], and never
//! routes itself. Routing belongs to the orchestrator's router; an agent may
//! attach an advisory handoff hint at most.
//!
//! Errors are split into retryable and fatal via [`AgentError::is_fatal`].
//! Retryable failures become `Failure` turns in the session history and cost
//! an iteration; fatal ones end the task.

mod coder;
mod critic;
mod executor;
mod locator;
mod planner;
mod registry;
mod reviewer;

pub use coder::CoderAgent;
pub use critic::CriticAgent;
pub use executor::{detect_test_command, ExecutorAgent};
pub use locator::LocatorAgent;
pub use planner::PlannerAgent;
pub use registry::AgentRegistry;
pub use reviewer::ReviewerAgent;

use std::time::Duration;

use async_trait::async_trait;

use crate::llm::LlmError;
use crate::task::{AgentOutput, AgentRole, Session};

/// Errors an agent invocation can produce.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    /// The agent did not finish within the per-call timeout. Retryable.
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),

    /// The router selected a role no agent is registered for. Fatal: the
    /// pipeline is misconfigured.
    #[error("no agent registered for role {0}")]
    UnknownRole(AgentRole),

    /// The model call failed or returned unusable output. Retryable.
    #[error("llm failure: {0}")]
    Llm(String),

    /// The coder produced a patch that cannot be applied. Retryable: the
    /// coder regenerates with the error in context.
    #[error("malformed patch: {0}")]
    MalformedPatch(String),

    /// The sandbox backend is unavailable. Fatal: no fix can be verified.
    #[error("sandbox infrastructure failure: {0}")]
    SandboxInfrastructure(String),

    /// A precondition inside the pipeline did not hold. Fatal.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Fatal errors end the task; retryable ones are folded into the session
    /// history and cost an iteration.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::UnknownRole(_)
                | AgentError::SandboxInfrastructure(_)
                | AgentError::Internal(_)
        )
    }
}

impl From<LlmError> for AgentError {
    fn from(e: LlmError) -> Self {
        AgentError::Llm(e.to_string())
    }
}

/// One specialist in the pipeline.
#[async_trait]
pub trait Agent: Send + Sync {
    /// The role this agent fills.
    fn role(&self) -> AgentRole;

    /// Take one turn: read the session, produce an output.
    ///
    /// Implementations must not mutate shared state; the orchestrator owns
    /// the session and appends the output itself.
    async fn handle(&self, session: &Session) -> Result<AgentOutput, AgentError>;
}

/// Wire up the full six-role pipeline from a configuration.
pub fn build_registry(
    llm: std::sync::Arc<dyn crate::llm::LlmClient>,
    sandbox: std::sync::Arc<crate::sandbox::SandboxManager>,
    config: &crate::config::Config,
) -> AgentRegistry {
    let models = &config.models;
    let mut registry = AgentRegistry::new(config.agent_timeout());
    registry.register(std::sync::Arc::new(PlannerAgent::new(
        llm.clone(),
        models.planner.clone(),
    )));
    registry.register(std::sync::Arc::new(LocatorAgent::new(
        llm.clone(),
        models.locator.clone(),
    )));
    registry.register(std::sync::Arc::new(CoderAgent::new(
        llm.clone(),
        models.coder.clone(),
    )));
    registry.register(std::sync::Arc::new(CriticAgent::new(
        llm.clone(),
        models.critic.clone(),
    )));
    registry.register(std::sync::Arc::new(ReviewerAgent::new(
        llm,
        models.reviewer.clone(),
    )));
    registry.register(std::sync::Arc::new(ExecutorAgent::new(
        sandbox,
        config.sandbox.clone(),
    )));
    registry
}

/// Byte cap per file excerpt included in a prompt.
pub(crate) const PROMPT_FILE_CAP: usize = 8 * 1024;

/// How many located files the coder gets to see in full.
pub(crate) const PROMPT_FILE_LIMIT: usize = 5;

/// How many workspace paths the locator's listing may contain.
pub(crate) const LISTING_LIMIT: usize = 200;

/// Relative paths of the files under `workspace`, hidden entries skipped.
pub(crate) fn workspace_listing(workspace: &std::path::Path, limit: usize) -> Vec<String> {
    let mut files = Vec::new();
    let walker = walkdir::WalkDir::new(workspace)
        .into_iter()
        .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'));
    for entry in walker.flatten() {
        if files.len() >= limit {
            break;
        }
        if entry.file_type().is_file() {
            if let Ok(rel) = entry.path().strip_prefix(workspace) {
                files.push(rel.to_string_lossy().into_owned());
            }
        }
    }
    files.sort();
    files
}

/// Read a workspace file for prompt inclusion, truncated at `cap` bytes.
/// Returns `None` for missing files and for paths that leave the workspace.
pub(crate) fn read_for_prompt(
    workspace: &std::path::Path,
    path: &str,
    cap: usize,
) -> Option<String> {
    let rel = std::path::Path::new(path);
    let escapes = rel.is_absolute()
        || rel
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir));
    if escapes {
        return None;
    }
    let mut text = std::fs::read_to_string(workspace.join(rel)).ok()?;
    if text.len() > cap {
        let mut cut = cap;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n... [truncated]");
    }
    Some(text)
}

/// Pull the JSON object or array out of a model reply, tolerating markdown
/// code fences and surrounding prose.
pub(crate) fn extract_json(content: &str) -> &str {
    let trimmed = content.trim();
    let start = trimmed.find(['{', '[']);
    let end = trimmed.rfind(['}', ']']);
    match (start, end) {
        (Some(s), Some(e)) if e >= s => &trimmed[s..=e],
        _ => trimmed,
    }
}
