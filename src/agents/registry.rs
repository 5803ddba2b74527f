//! Role-indexed agent lookup with a uniform invocation timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{Agent, AgentError};
use crate::task::{AgentOutput, AgentRole, Session};

/// Holds one agent per role and enforces the per-call timeout.
pub struct AgentRegistry {
    agents: HashMap<AgentRole, Arc<dyn Agent>>,
    timeout: Duration,
}

impl AgentRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agents: HashMap::new(),
            timeout,
        }
    }

    /// Register an agent under its own role. A later registration for the
    /// same role replaces the earlier one.
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.role(), agent);
    }

    pub fn has(&self, role: AgentRole) -> bool {
        self.agents.contains_key(&role)
    }

    /// Invoke the agent for `role` with the timeout applied.
    pub async fn invoke(
        &self,
        role: AgentRole,
        session: &Session,
    ) -> Result<AgentOutput, AgentError> {
        let agent = self
            .agents
            .get(&role)
            .ok_or(AgentError::UnknownRole(role))?;

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(self.timeout, agent.handle(session))
            .await
            .map_err(|_| AgentError::Timeout(self.timeout))?;
        tracing::debug!(
            role = %role,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Agent turn finished"
        );
        result
    }
}
