//! Reviewer: final quality gate on a passing fix.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{extract_json, read_for_prompt, Agent, AgentError, PROMPT_FILE_CAP};
use crate::llm::{ChatMessage, LlmClient};
use crate::task::{
    AgentOutput, AgentPayload, AgentRole, Review, ReviewVerdict, Session,
};

const SYSTEM_PROMPT: &str = "You are the code-review specialist in an \
automated debugging pipeline. The candidate patch passed its tests; judge \
whether it is an acceptable fix (correct, minimal, no obvious regressions). \
Respond with JSON only:\n\
{\"verdict\": \"approve\"|\"request_changes\", \"comments\": \"<reasoning>\"}";

pub struct ReviewerAgent {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl ReviewerAgent {
    pub fn new(llm: Arc<dyn LlmClient>, model: String) -> Self {
        Self { llm, model }
    }

    fn build_prompt(&self, session: &Session) -> String {
        let mut prompt = format!("Bug report:\n{}\n", session.bug_report());

        if let Some(patch) = session.latest_patch() {
            match serde_json::to_string_pretty(patch) {
                Ok(json) => prompt.push_str(&format!("\nCandidate patch:\n{}\n", json)),
                Err(_) => prompt.push_str(&format!("\nPatch targets: {}\n", patch.path())),
            }
            // Show the unpatched file so the judgment is grounded in what
            // the patch actually changes.
            if let Some(workspace) = &session.context().workspace {
                if let Some(contents) = read_for_prompt(workspace, patch.path(), PROMPT_FILE_CAP) {
                    prompt.push_str(&format!(
                        "\nOriginal contents of {}:\n```\n{}\n```\n",
                        patch.path(),
                        contents
                    ));
                }
            }
        }
        if let Some(result) = session.latest_execution() {
            if let Some(tests) = result.tests {
                prompt.push_str(&format!(
                    "\nTests: {} passed, {} failed\n",
                    tests.passed, tests.failed
                ));
            }
        }

        prompt
    }
}

#[derive(Deserialize)]
struct ReviewWire {
    verdict: ReviewVerdict,
    #[serde(default)]
    comments: String,
}

#[async_trait]
impl Agent for ReviewerAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Reviewer
    }

    async fn handle(&self, session: &Session) -> Result<AgentOutput, AgentError> {
        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(self.build_prompt(session)),
        ];
        let response = self.llm.chat(&self.model, &messages).await?;

        let wire: ReviewWire = serde_json::from_str(extract_json(&response.content))
            .map_err(|e| AgentError::Llm(format!("unparseable review: {}", e)))?;

        let review = Review {
            verdict: wire.verdict,
            comments: wire.comments,
        };
        let output = match review.verdict {
            ReviewVerdict::Approve => AgentOutput::new(AgentPayload::Review(review)),
            ReviewVerdict::RequestChanges => {
                AgentOutput::with_hint(AgentPayload::Review(review), AgentRole::Coder)
            }
        };
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::task::{Task, TaskContext};

    fn session() -> Session {
        let task = Task::new("bug".to_string(), TaskContext::default()).unwrap();
        Session::new(&task)
    }

    fn reviewer(response: &str) -> ReviewerAgent {
        ReviewerAgent::new(
            Arc::new(ScriptedLlm::new(vec![response.to_string()])),
            "test-model".to_string(),
        )
    }

    #[tokio::test]
    async fn approval_has_no_handoff() {
        let agent = reviewer("{\"verdict\": \"approve\", \"comments\": \"minimal and correct\"}");
        let output = agent.handle(&session()).await.unwrap();
        let AgentPayload::Review(review) = &output.payload else {
            panic!("expected a review");
        };
        assert_eq!(review.verdict, ReviewVerdict::Approve);
        assert_eq!(output.handoff_hint, None);
    }

    #[tokio::test]
    async fn requested_changes_hint_coder() {
        let agent =
            reviewer("{\"verdict\": \"request_changes\", \"comments\": \"fix naming too\"}");
        let output = agent.handle(&session()).await.unwrap();
        assert_eq!(output.handoff_hint, Some(AgentRole::Coder));
    }

    #[tokio::test]
    async fn prompt_includes_patch_target_contents() {
        use crate::llm::RecordingLlm;
        use crate::task::{AgentOutput, AgentPayload, AgentRole, Patch, PatchChange};
        use uuid::Uuid;

        let dir = std::env::temp_dir().join(format!("autodebug-rev-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("pagination.py"), "def pages(n, per):\n    return n // per\n")
            .unwrap();

        let context = TaskContext {
            workspace: Some(dir.clone()),
            ..TaskContext::default()
        };
        let task = Task::new("bug".to_string(), context).unwrap();
        let mut session = Session::new(&task);
        session.append(
            AgentRole::Coder,
            AgentOutput::new(AgentPayload::Patch(Patch {
                change: PatchChange::Replace {
                    path: "pagination.py".to_string(),
                    contents: "fixed\n".to_string(),
                },
                iteration: 1,
            })),
        );

        let llm = Arc::new(RecordingLlm::new(
            "{\"verdict\": \"approve\", \"comments\": \"ok\"}",
        ));
        let agent = ReviewerAgent::new(llm.clone(), "test-model".to_string());
        agent.handle(&session).await.unwrap();

        let prompt = llm
            .seen()
            .iter()
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(prompt.contains("return n // per"));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn unknown_verdict_is_retryable() {
        let agent = reviewer("{\"verdict\": \"maybe\"}");
        let err = agent.handle(&session()).await.unwrap_err();
        assert!(matches!(err, AgentError::Llm(_)));
        assert!(!err.is_fatal());
    }
}
