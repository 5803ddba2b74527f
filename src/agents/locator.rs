//! Locator: narrows the fix down to the relevant files.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{extract_json, workspace_listing, Agent, AgentError, LISTING_LIMIT};
use crate::llm::{ChatMessage, LlmClient};
use crate::task::{AgentOutput, AgentPayload, AgentRole, Session};

const SYSTEM_PROMPT: &str = "You are the fault-localization specialist in an \
automated debugging pipeline. Given a bug report and a fix plan, name the \
files most likely to need changes. Respond with JSON only:\n\
{\"files\": [\"path/one\", \"path/two\"], \"notes\": \"<short reasoning>\"}";

pub struct LocatorAgent {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl LocatorAgent {
    pub fn new(llm: Arc<dyn LlmClient>, model: String) -> Self {
        Self { llm, model }
    }

    fn build_prompt(&self, session: &Session) -> String {
        let mut prompt = format!("Bug report:\n{}\n", session.bug_report());
        if let Some(plan) = session.latest_plan() {
            prompt.push_str("\nFix plan:\n");
            for (i, step) in plan.steps.iter().enumerate() {
                prompt.push_str(&format!("{}. [{}] {}\n", i + 1, step.target, step.action));
            }
        }
        if let Some(language) = &session.context().language {
            prompt.push_str(&format!("\nLanguage: {}\n", language));
        }
        if let Some(workspace) = &session.context().workspace {
            let files = workspace_listing(workspace, LISTING_LIMIT);
            if !files.is_empty() {
                prompt.push_str("\nWorkspace files:\n");
                for file in &files {
                    prompt.push_str(&format!("- {}\n", file));
                }
            }
        }
        prompt
    }
}

#[derive(Deserialize)]
struct LocatedWire {
    files: Vec<String>,
    #[serde(default)]
    notes: String,
}

#[async_trait]
impl Agent for LocatorAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Locator
    }

    async fn handle(&self, session: &Session) -> Result<AgentOutput, AgentError> {
        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(self.build_prompt(session)),
        ];
        let response = self.llm.chat(&self.model, &messages).await?;

        let wire: LocatedWire = serde_json::from_str(extract_json(&response.content))
            .map_err(|e| AgentError::Llm(format!("unparseable location result: {}", e)))?;
        if wire.files.is_empty() {
            return Err(AgentError::Llm("locator named no files".to_string()));
        }

        Ok(AgentOutput::with_hint(
            AgentPayload::Located {
                files: wire.files,
                notes: wire.notes,
            },
            AgentRole::Coder,
        ))
    }
}
