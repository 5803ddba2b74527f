//! Planner: turns a bug report into an ordered fix plan.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{extract_json, Agent, AgentError};
use crate::llm::{ChatMessage, LlmClient};
use crate::task::{AgentOutput, AgentPayload, AgentRole, Plan, PlanStep, RiskLevel, Session};

const SYSTEM_PROMPT: &str = "You are the planning specialist in an automated \
debugging pipeline. Given a bug report, produce a short ordered plan for \
fixing it. Respond with JSON only, in this shape:\n\
{\"steps\": [{\"target\": \"<file or area>\", \"action\": \"<what to do>\", \
\"risk\": \"low\"|\"medium\"|\"high\"}]}\n\
Keep the plan minimal; do not plan refactors beyond the fix.";

pub struct PlannerAgent {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl PlannerAgent {
    pub fn new(llm: Arc<dyn LlmClient>, model: String) -> Self {
        Self { llm, model }
    }

    fn build_prompt(&self, session: &Session) -> String {
        let mut prompt = format!("Bug report:\n{}\n", session.bug_report());

        let context = session.context();
        if let Some(language) = &context.language {
            prompt.push_str(&format!("Language: {}\n", language));
        }
        if let Some(framework) = &context.framework {
            prompt.push_str(&format!("Framework: {}\n", framework));
        }

        if !session.advisory().is_empty() {
            prompt.push_str("\nSimilar previously solved issues (advisory only):\n");
            for record in session.advisory() {
                prompt.push_str(&format!(
                    "- {} (fixed in {}, similarity {:.2})\n",
                    record.description,
                    record.patch.path(),
                    record.similarity
                ));
            }
        }

        // On re-planning, surface what went wrong last time.
        if let Some(result) = session.latest_execution() {
            if !result.passed() {
                prompt.push_str(&format!(
                    "\nA previous fix attempt failed. Last test output:\n{}\n{}\n",
                    result.stdout, result.stderr
                ));
            }
        }
        if let Some(message) = session.last_message() {
            if let AgentPayload::Failure { error } = &message.payload {
                prompt.push_str(&format!("\nThe previous turn failed: {}\n", error));
            }
        }

        prompt
    }
}

#[derive(Deserialize)]
struct PlanWire {
    steps: Vec<PlanStepWire>,
}

#[derive(Deserialize)]
struct PlanStepWire {
    target: String,
    action: String,
    #[serde(default)]
    risk: Option<RiskLevel>,
}

#[async_trait]
impl Agent for PlannerAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Planner
    }

    async fn handle(&self, session: &Session) -> Result<AgentOutput, AgentError> {
        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(self.build_prompt(session)),
        ];
        let response = self.llm.chat(&self.model, &messages).await?;

        let wire: PlanWire = serde_json::from_str(extract_json(&response.content))
            .map_err(|e| AgentError::Llm(format!("unparseable plan: {}", e)))?;
        if wire.steps.is_empty() {
            return Err(AgentError::Llm("plan has no steps".to_string()));
        }

        let plan = Plan {
            steps: wire
                .steps
                .into_iter()
                .map(|s| PlanStep {
                    target: s.target,
                    action: s.action,
                    risk: s.risk.unwrap_or(RiskLevel::Medium),
                })
                .collect(),
            iteration: session.iteration(),
        };
        Ok(AgentOutput::with_hint(
            AgentPayload::Plan(plan),
            AgentRole::Locator,
        ))
    }
}
