//! Executor: verifies the candidate patch in the sandbox. No model involved.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Agent, AgentError};
use crate::config::SandboxConfig;
use crate::sandbox::{ExecutionRequest, SandboxError, SandboxManager};
use crate::task::{AgentOutput, AgentPayload, AgentRole, Session};

/// Used when no command is configured and no workspace marker matches.
const DEFAULT_TEST_COMMAND: &str = "python -m pytest";

/// Infer the test command from well-known workspace markers.
pub fn detect_test_command(workspace: &Path) -> Option<String> {
    let has = |name: &str| workspace.join(name).exists();

    if has("pytest.ini") || has("conftest.py") || has("pyproject.toml") || has("setup.py") {
        Some("python -m pytest -q".to_string())
    } else if has("package.json") {
        Some("npm test".to_string())
    } else if has("go.mod") {
        Some("go test ./...".to_string())
    } else if has("Cargo.toml") {
        Some("cargo test".to_string())
    } else {
        None
    }
}

pub struct ExecutorAgent {
    sandbox: Arc<SandboxManager>,
    limits: SandboxConfig,
}

impl ExecutorAgent {
    pub fn new(sandbox: Arc<SandboxManager>, limits: SandboxConfig) -> Self {
        Self { sandbox, limits }
    }

    fn resolve_command(&self, session: &Session) -> String {
        if let Some(command) = &session.context().test_command {
            return command.clone();
        }
        if let Some(workspace) = &session.context().workspace {
            if let Some(command) = detect_test_command(workspace) {
                tracing::debug!("Detected test command: {}", command);
                return command;
            }
        }
        tracing::debug!(
            "No test command configured or detected, falling back to '{}'",
            DEFAULT_TEST_COMMAND
        );
        DEFAULT_TEST_COMMAND.to_string()
    }
}

#[async_trait]
impl Agent for ExecutorAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Executor
    }

    async fn handle(&self, session: &Session) -> Result<AgentOutput, AgentError> {
        let patch = session
            .latest_patch()
            .ok_or_else(|| AgentError::Internal("no candidate patch to execute".to_string()))?
            .clone();
        let command = self.resolve_command(session);

        let request = ExecutionRequest {
            workspace: session.context().workspace.clone(),
            patches: vec![patch],
            command,
            limits: self.limits.clone(),
        };

        let result = self
            .sandbox
            .run(session.task_id(), &request)
            .await
            .map_err(|e| match e {
                SandboxError::MalformedPatch(msg) => AgentError::MalformedPatch(msg),
                SandboxError::Infrastructure(msg) => AgentError::SandboxInfrastructure(msg),
            })?;

        let hint = if result.passed() {
            AgentRole::Reviewer
        } else {
            AgentRole::Critic
        };
        Ok(AgentOutput::with_hint(
            AgentPayload::Execution(result),
            hint,
        ))
    }
}
