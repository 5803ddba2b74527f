//! Deterministic handoff routing between agent turns.
//!
//! The router owns the pipeline topology. It derives the next step from the
//! last session turn alone, so the same history always routes the same way.
//! Agent handoff hints are advisory: a hint that disagrees with the table is
//! logged and ignored.
//!
//! Topology (critic and reviewer stages can each be disabled):
//!
//! ```text
//! planner -> locator -> coder -> executor --pass--> reviewer --approve--> done
//!                         ^          |                  |
//!                         |        fail          request_changes
//!                         |          v                  |
//!                         +------ critic <--------------+
//! ```

use crate::task::{AgentPayload, AgentRole, ReviewVerdict, Session};

/// Where the pipeline goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// Invoke this role
    Invoke(AgentRole),
    /// The task is done, with this reason
    Succeeded(String),
}

/// The router's verdict for one turn boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub next: NextStep,
    /// True when this edge re-enters the fix loop and costs an iteration
    pub new_iteration: bool,
}

impl RouteDecision {
    fn invoke(role: AgentRole) -> Self {
        Self {
            next: NextStep::Invoke(role),
            new_iteration: false,
        }
    }

    fn reenter(role: AgentRole) -> Self {
        Self {
            next: NextStep::Invoke(role),
            new_iteration: true,
        }
    }

    fn succeeded(reason: impl Into<String>) -> Self {
        Self {
            next: NextStep::Succeeded(reason.into()),
            new_iteration: false,
        }
    }
}

/// Stateless router over the pipeline topology.
#[derive(Debug, Clone)]
pub struct HandoffRouter {
    enable_critic: bool,
    enable_reviewer: bool,
}

impl HandoffRouter {
    pub fn new(enable_critic: bool, enable_reviewer: bool) -> Self {
        Self {
            enable_critic,
            enable_reviewer,
        }
    }

    /// Decide the next step after the session's last turn.
    pub fn route(&self, session: &Session) -> RouteDecision {
        let Some(message) = session.last_message() else {
            return RouteDecision::invoke(AgentRole::Planner);
        };

        let decision = match &message.payload {
            AgentPayload::Plan(_) => RouteDecision::invoke(AgentRole::Locator),
            AgentPayload::Located { .. } => RouteDecision::invoke(AgentRole::Coder),
            AgentPayload::Patch(_) => RouteDecision::invoke(AgentRole::Executor),
            AgentPayload::Execution(result) => {
                if result.passed() {
                    if self.enable_reviewer {
                        RouteDecision::invoke(AgentRole::Reviewer)
                    } else {
                        RouteDecision::succeeded("sandbox run passed")
                    }
                } else if self.enable_critic {
                    // The critic turn belongs to the current iteration; the
                    // iteration advances when the coder re-enters.
                    RouteDecision::invoke(AgentRole::Critic)
                } else {
                    RouteDecision::reenter(AgentRole::Coder)
                }
            }
            AgentPayload::Feedback { .. } => RouteDecision::reenter(AgentRole::Coder),
            AgentPayload::Review(review) => match review.verdict {
                ReviewVerdict::Approve => RouteDecision::succeeded("reviewer approved the fix"),
                ReviewVerdict::RequestChanges => RouteDecision::reenter(AgentRole::Coder),
            },
            // A retryable failure re-enters at the stage that can recover:
            // planning and location retry themselves, everything downstream
            // goes back to the coder.
            AgentPayload::Failure { .. } => match message.role {
                AgentRole::Planner => RouteDecision::reenter(AgentRole::Planner),
                AgentRole::Locator => RouteDecision::reenter(AgentRole::Locator),
                _ => RouteDecision::reenter(AgentRole::Coder),
            },
        };

        if let Some(hint) = message.handoff_hint {
            if decision.next != NextStep::Invoke(hint) {
                tracing::debug!(
                    role = %message.role,
                    hint = %hint,
                    "Ignoring handoff hint inconsistent with the routing table"
                );
            }
        }

        decision
    }
}
