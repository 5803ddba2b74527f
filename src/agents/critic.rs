//! Critic: diagnoses why a candidate fix failed.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Agent, AgentError};
use crate::llm::{ChatMessage, LlmClient};
use crate::task::{AgentOutput, AgentPayload, AgentRole, Session};

const SYSTEM_PROMPT: &str = "You are the failure-analysis specialist in an \
automated debugging pipeline. A candidate fix was tried and the tests still \
fail. Explain, concretely and briefly, what is still wrong and what the next \
patch should do differently. Plain text, no code blocks.";

pub struct CriticAgent {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl CriticAgent {
    pub fn new(llm: Arc<dyn LlmClient>, model: String) -> Self {
        Self { llm, model }
    }

    fn build_prompt(&self, session: &Session) -> String {
        let mut prompt = format!("Bug report:\n{}\n", session.bug_report());

        if let Some(patch) = session.latest_patch() {
            prompt.push_str(&format!("\nLast patch targeted: {}\n", patch.path()));
        }
        if let Some(result) = session.latest_execution() {
            prompt.push_str(&format!(
                "\nTest run (exit {:?}, limit violation: {}):\nstdout:\n{}\nstderr:\n{}\n",
                result.exit, result.resource_limit_violation, result.stdout, result.stderr
            ));
        }
        if let Some(message) = session.last_message() {
            if let AgentPayload::Failure { error } = &message.payload {
                prompt.push_str(&format!("\nThe previous turn failed outright: {}\n", error));
            }
        }

        prompt
    }
}

#[async_trait]
impl Agent for CriticAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Critic
    }

    async fn handle(&self, session: &Session) -> Result<AgentOutput, AgentError> {
        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(self.build_prompt(session)),
        ];
        let response = self.llm.chat(&self.model, &messages).await?;

        let text = response.content.trim().to_string();
        if text.is_empty() {
            return Err(AgentError::Llm("critic produced no feedback".to_string()));
        }

        Ok(AgentOutput::with_hint(
            AgentPayload::Feedback { text },
            AgentRole::Coder,
        ))
    }
}
