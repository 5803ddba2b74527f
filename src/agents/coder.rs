//! Coder: produces the candidate patch.

use std::sync::Arc;

use async_trait::async_trait;

use super::{
    extract_json, read_for_prompt, Agent, AgentError, PROMPT_FILE_CAP, PROMPT_FILE_LIMIT,
};
use crate::llm::{ChatMessage, LlmClient};
use crate::task::{AgentOutput, AgentPayload, AgentRole, Patch, PatchChange, Session};

const SYSTEM_PROMPT: &str = "You are the code-fixing specialist in an \
automated debugging pipeline. Produce exactly one patch for the bug. \
Respond with JSON only, one of:\n\
{\"kind\": \"diff\", \"path\": \"<file>\", \"diff\": \"<unified diff>\"}\n\
{\"kind\": \"replace\", \"path\": \"<file>\", \"contents\": \"<full new file>\"}\n\
Prefer a minimal diff. Do not touch files outside the located set unless \
strictly necessary.";

pub struct CoderAgent {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl CoderAgent {
    pub fn new(llm: Arc<dyn LlmClient>, model: String) -> Self {
        Self { llm, model }
    }

    fn build_prompt(&self, session: &Session) -> String {
        let mut prompt = format!("Bug report:\n{}\n", session.bug_report());

        if let Some(plan) = session.latest_plan() {
            prompt.push_str("\nFix plan:\n");
            for step in &plan.steps {
                prompt.push_str(&format!("- [{}] {}\n", step.target, step.action));
            }
        }
        if let Some(files) = session.located_files() {
            prompt.push_str(&format!("\nRelevant files: {}\n", files.join(", ")));

            // Diffs need exact context lines, so the coder sees the current
            // file contents, not just the paths.
            if let Some(workspace) = &session.context().workspace {
                for path in files.iter().take(PROMPT_FILE_LIMIT) {
                    if let Some(contents) = read_for_prompt(workspace, path, PROMPT_FILE_CAP) {
                        prompt.push_str(&format!(
                            "\nCurrent contents of {}:\n```\n{}\n```\n",
                            path, contents
                        ));
                    }
                }
            }
        }

        // Feed back everything that went wrong since the last patch.
        if let Some(result) = session.latest_execution() {
            if !result.passed() {
                prompt.push_str(&format!(
                    "\nThe previous patch failed in the sandbox.\nstdout:\n{}\nstderr:\n{}\n",
                    result.stdout, result.stderr
                ));
            }
        }
        for message in session.messages().iter().rev().take(3) {
            match &message.payload {
                AgentPayload::Feedback { text } => {
                    prompt.push_str(&format!("\nCritic feedback:\n{}\n", text));
                }
                AgentPayload::Review(review) => {
                    prompt.push_str(&format!("\nReviewer comments:\n{}\n", review.comments));
                }
                AgentPayload::Failure { error } => {
                    prompt.push_str(&format!("\nA previous turn failed: {}\n", error));
                }
                _ => {}
            }
        }

        prompt
    }
}

#[async_trait]
impl Agent for CoderAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Coder
    }

    async fn handle(&self, session: &Session) -> Result<AgentOutput, AgentError> {
        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(self.build_prompt(session)),
        ];
        let response = self.llm.chat(&self.model, &messages).await?;

        let change: PatchChange = serde_json::from_str(extract_json(&response.content))
            .map_err(|e| AgentError::MalformedPatch(format!("unparseable patch: {}", e)))?;

        let patch = Patch {
            change,
            iteration: session.iteration(),
        };
        Ok(AgentOutput::with_hint(
            AgentPayload::Patch(patch),
            AgentRole::Executor,
        ))
    }
}
