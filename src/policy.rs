//! Termination policy: decides when the fix loop stops.
//!
//! Evaluated at every turn boundary, after routing and before the next agent
//! is invoked. The iteration budget is checked exactly when a route decision
//! would start a new iteration, so in-flight iterations always finish their
//! critic or reviewer turns.

use crate::router::{NextStep, RouteDecision};
use crate::task::{AgentRole, Session};

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationVerdict {
    /// Keep going; invoke this role next
    Continue { next: AgentRole },
    /// The task is solved
    Succeeded { reason: String },
    /// The iteration budget ran out
    FailedExhausted { reason: String },
    /// A fatal error ended the task
    FailedFatal { reason: String },
}

impl TerminationVerdict {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TerminationVerdict::Continue { .. })
    }
}

#[derive(Debug, Clone)]
pub struct TerminationPolicy {
    max_iterations: u32,
}

impl TerminationPolicy {
    /// `max_iterations` must be >= 1; config validation enforces this.
    pub fn new(max_iterations: u32) -> Self {
        Self { max_iterations }
    }

    /// Evaluate a route decision against the session state.
    pub fn evaluate(&self, session: &Session, decision: &RouteDecision) -> TerminationVerdict {
        match &decision.next {
            NextStep::Succeeded(reason) => TerminationVerdict::Succeeded {
                reason: reason.clone(),
            },
            NextStep::Invoke(role) => {
                if decision.new_iteration && session.iteration() >= self.max_iterations {
                    TerminationVerdict::FailedExhausted {
                        reason: format!(
                            "no passing fix within {} iteration(s)",
                            self.max_iterations
                        ),
                    }
                } else {
                    TerminationVerdict::Continue { next: *role }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskContext};

    fn session() -> Session {
        let task = Task::new("bug".to_string(), TaskContext::default()).unwrap();
        Session::new(&task)
    }

    fn reenter_coder() -> RouteDecision {
        RouteDecision {
            next: NextStep::Invoke(AgentRole::Coder),
            new_iteration: true,
        }
    }

    #[test]
    fn success_always_wins() {
        let policy = TerminationPolicy::new(1);
        let decision = RouteDecision {
            next: NextStep::Succeeded("reviewer approved the fix".to_string()),
            new_iteration: false,
        };
        assert!(matches!(
            policy.evaluate(&session(), &decision),
            TerminationVerdict::Succeeded { .. }
        ));
    }

    #[test]
    fn budget_exhausts_only_on_new_iterations() {
        let policy = TerminationPolicy::new(1);
        let s = session();

        // Staying inside iteration 1 is fine even at the budget.
        let within = RouteDecision {
            next: NextStep::Invoke(AgentRole::Critic),
            new_iteration: false,
        };
        assert!(matches!(
            policy.evaluate(&s, &within),
            TerminationVerdict::Continue {
                next: AgentRole::Critic
            }
        ));

        // Starting iteration 2 is not.
        assert!(matches!(
            policy.evaluate(&s, &reenter_coder()),
            TerminationVerdict::FailedExhausted { .. }
        ));
    }

    #[test]
    fn budget_allows_reentry_below_the_cap() {
        let policy = TerminationPolicy::new(3);
        let mut s = session();
        assert!(matches!(
            policy.evaluate(&s, &reenter_coder()),
            TerminationVerdict::Continue { .. }
        ));

        s.begin_iteration();
        s.begin_iteration();
        assert_eq!(s.iteration(), 3);
        assert!(matches!(
            policy.evaluate(&s, &reenter_coder()),
            TerminationVerdict::FailedExhausted { .. }
        ));
    }

    #[test]
    fn terminal_classification() {
        assert!(!TerminationVerdict::Continue {
            next: AgentRole::Planner
        }
        .is_terminal());
        assert!(TerminationVerdict::Succeeded {
            reason: String::new()
        }
        .is_terminal());
        assert!(TerminationVerdict::FailedExhausted {
            reason: String::new()
        }
        .is_terminal());
        assert!(TerminationVerdict::FailedFatal {
            reason: String::new()
        }
        .is_terminal());
    }
}
