//! The control loop that drives a task through the agent pipeline.
//!
//! One turn per loop pass: route from the last session message, check the
//! termination policy, then invoke the chosen agent. All session mutation
//! happens here; agents only read. Cancellation is checked at every turn
//! boundary and while an agent call is in flight.

use tokio_util::sync::CancellationToken;

use crate::agents::AgentRegistry;
use crate::config::Config;
use crate::memory::{Memory, MemoryOutcome};
use crate::policy::{TerminationPolicy, TerminationVerdict};
use crate::router::HandoffRouter;
use crate::task::{Session, Task};

/// How many similar past solutions to surface to the planner.
const ADVISORY_LIMIT: usize = 3;

/// Final state of a finished run: the terminal task plus its full history.
pub struct TaskRun {
    pub task: Task,
    pub session: Session,
}

pub struct Orchestrator {
    registry: AgentRegistry,
    router: HandoffRouter,
    policy: TerminationPolicy,
    memory: Memory,
}

impl Orchestrator {
    pub fn new(config: &Config, registry: AgentRegistry, memory: Memory) -> Self {
        Self {
            registry,
            router: HandoffRouter::new(config.enable_critic, config.enable_reviewer),
            policy: TerminationPolicy::new(config.max_iterations),
            memory,
        }
    }

    /// Drive a task to a terminal state.
    pub async fn run(&self, task: Task, cancel: CancellationToken) -> TaskRun {
        self.run_observed(task, cancel, |_, _| {}).await
    }

    /// Like [`Orchestrator::run`], calling `observe` with the current task
    /// and session after every turn boundary.
    pub async fn run_observed<F>(
        &self,
        mut task: Task,
        cancel: CancellationToken,
        observe: F,
    ) -> TaskRun
    where
        F: Fn(&Task, &Session),
    {
        let mut session = Session::new(&task);
        if let Err(e) = task.start() {
            tracing::error!(task_id = %task.id(), "Could not start task: {}", e);
            return TaskRun { task, session };
        }
        tracing::info!(task_id = %task.id(), "Task started");

        if self.memory.is_enabled() {
            let advisory = self
                .memory
                .retrieve(session.bug_report(), ADVISORY_LIMIT)
                .await;
            if !advisory.is_empty() {
                tracing::info!(
                    task_id = %task.id(),
                    count = advisory.len(),
                    "Surfacing similar past solutions to the planner"
                );
                session.set_advisory(advisory);
            }
        }

        loop {
            let decision = self.router.route(&session);
            match self.policy.evaluate(&session, &decision) {
                TerminationVerdict::Succeeded { reason } => {
                    tracing::info!(task_id = %task.id(), "Task succeeded: {}", reason);
                    if let Err(e) = task.succeed() {
                        tracing::error!(task_id = %task.id(), "Invalid transition: {}", e);
                    }
                    if let Some(patch) = session.latest_patch() {
                        self.memory
                            .store(session.bug_report(), patch, MemoryOutcome::Succeeded)
                            .await;
                    }
                    break;
                }
                TerminationVerdict::FailedExhausted { reason }
                | TerminationVerdict::FailedFatal { reason } => {
                    tracing::warn!(task_id = %task.id(), "Task failed: {}", reason);
                    if let Err(e) = task.fail(reason) {
                        tracing::error!(task_id = %task.id(), "Invalid transition: {}", e);
                    }
                    break;
                }
                TerminationVerdict::Continue { next } => {
                    if decision.new_iteration {
                        session.begin_iteration();
                        tracing::info!(
                            task_id = %task.id(),
                            iteration = session.iteration(),
                            "Starting fix iteration"
                        );
                    }

                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::info!(task_id = %task.id(), "Task cancelled");
                            if let Err(e) = task.cancel() {
                                tracing::error!(task_id = %task.id(), "Invalid transition: {}", e);
                            }
                            break;
                        }
                        outcome = self.registry.invoke(next, &session) => outcome,
                    };

                    match outcome {
                        Ok(output) => {
                            session.append(next, output);
                        }
                        Err(e) if e.is_fatal() => {
                            tracing::error!(task_id = %task.id(), "Fatal agent error: {}", e);
                            if let Err(te) = task.fail(format!("fatal {} error: {}", next, e)) {
                                tracing::error!(task_id = %task.id(), "Invalid transition: {}", te);
                            }
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(task_id = %task.id(), role = %next, "Agent turn failed: {}", e);
                            session.append_failure(next, e.to_string());
                        }
                    }
                }
            }
            observe(&task, &session);
        }

        observe(&task, &session);
        TaskRun { task, session }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{
        Agent, AgentError, CoderAgent, CriticAgent, ExecutorAgent, LocatorAgent, PlannerAgent,
        ReviewerAgent,
    };
    use crate::llm::ScriptedLlm;
    use crate::memory::{HashEmbedder, SqliteMemoryStore};
    use crate::sandbox::{SandboxError, SandboxManager, ScriptedSandbox};
    use crate::task::{
        AgentOutput, AgentPayload, AgentRole, ExecutionResult, ExitStatus, TaskContext,
        TaskStatus,
    };
    use std::sync::Arc;
    use std::time::Duration;

    const PLAN: &str =
        "{\"steps\": [{\"target\": \"pagination.py\", \"action\": \"round up\", \"risk\": \"low\"}]}";
    const LOCATED: &str = "{\"files\": [\"pagination.py\"], \"notes\": \"page math\"}";
    const PATCH: &str = "{\"kind\": \"replace\", \"path\": \"pagination.py\", \
                         \"contents\": \"def pages(n, per):\\n    return -(-n // per)\\n\"}";
    const FEEDBACK: &str = "Still truncating; use ceiling division.";
    const APPROVE: &str = "{\"verdict\": \"approve\", \"comments\": \"minimal\"}";

    fn execution(code: i32) -> Result<ExecutionResult, SandboxError> {
        Ok(ExecutionResult {
            exit: ExitStatus::Exited { code },
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 5,
            resource_limit_violation: false,
            tests: None,
        })
    }

    struct Script {
        planner: Vec<&'static str>,
        locator: Vec<&'static str>,
        coder: Vec<&'static str>,
        critic: Vec<&'static str>,
        reviewer: Vec<&'static str>,
        sandbox: Vec<Result<ExecutionResult, SandboxError>>,
    }

    fn registry(script: Script) -> AgentRegistry {
        let llm = |responses: Vec<&str>| -> Arc<ScriptedLlm> {
            Arc::new(ScriptedLlm::new(
                responses.into_iter().map(String::from).collect(),
            ))
        };
        let sandbox = Arc::new(SandboxManager::new(
            Arc::new(ScriptedSandbox::new(script.sandbox)),
            1,
        ));

        let mut registry = AgentRegistry::new(Duration::from_secs(5));
        registry.register(Arc::new(PlannerAgent::new(llm(script.planner), "m".into())));
        registry.register(Arc::new(LocatorAgent::new(llm(script.locator), "m".into())));
        registry.register(Arc::new(CoderAgent::new(llm(script.coder), "m".into())));
        registry.register(Arc::new(CriticAgent::new(llm(script.critic), "m".into())));
        registry.register(Arc::new(ReviewerAgent::new(llm(script.reviewer), "m".into())));
        registry.register(Arc::new(ExecutorAgent::new(
            sandbox,
            crate::config::SandboxConfig::default(),
        )));
        registry
    }

    fn task() -> Task {
        let context = TaskContext {
            test_command: Some("pytest".to_string()),
            ..TaskContext::default()
        };
        Task::new("pagination shows one page too few".to_string(), context).unwrap()
    }

    async fn test_memory() -> Memory {
        let store = SqliteMemoryStore::open_in_memory(Arc::new(HashEmbedder::new(64)))
            .await
            .unwrap();
        Memory::new(Arc::new(store), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn fail_then_fix_succeeds_in_two_iterations() {
        let config = Config::default();
        let memory = test_memory().await;
        let orchestrator = Orchestrator::new(
            &config,
            registry(Script {
                planner: vec![PLAN],
                locator: vec![LOCATED],
                coder: vec![PATCH, PATCH],
                critic: vec![FEEDBACK],
                reviewer: vec![APPROVE],
                sandbox: vec![execution(1), execution(0)],
            }),
            memory.clone(),
        );

        let run = orchestrator.run(task(), CancellationToken::new()).await;

        assert_eq!(*run.task.status(), TaskStatus::Succeeded);
        assert_eq!(run.session.iteration(), 2);
        // plan, located, patch, exec, feedback, patch, exec, review
        assert_eq!(run.session.messages().len(), 8);
        // Exactly one record stored for the winning patch.
        assert_eq!(memory.retrieve("pagination", 10).await.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_still_gets_its_critic_turn() {
        let config = Config {
            max_iterations: 1,
            ..Config::default()
        };
        let memory = test_memory().await;
        let orchestrator = Orchestrator::new(
            &config,
            registry(Script {
                planner: vec![PLAN],
                locator: vec![LOCATED],
                coder: vec![PATCH],
                critic: vec![FEEDBACK],
                reviewer: vec![],
                sandbox: vec![execution(1)],
            }),
            memory.clone(),
        );

        let run = orchestrator.run(task(), CancellationToken::new()).await;

        assert!(matches!(run.task.status(), TaskStatus::Failed { .. }));
        assert_eq!(run.session.iteration(), 1);
        // The critic turn inside iteration 1 still ran.
        assert!(run
            .session
            .messages()
            .iter()
            .any(|m| matches!(m.payload, AgentPayload::Feedback { .. })));
        // A failed task never reaches the memory store.
        assert!(memory.retrieve("pagination", 10).await.is_empty());
    }

    #[tokio::test]
    async fn disabled_stages_shorten_the_pipeline() {
        let config = Config {
            enable_critic: false,
            enable_reviewer: false,
            ..Config::default()
        };
        let orchestrator = Orchestrator::new(
            &config,
            registry(Script {
                planner: vec![PLAN],
                locator: vec![LOCATED],
                coder: vec![PATCH],
                critic: vec![],
                reviewer: vec![],
                sandbox: vec![execution(0)],
            }),
            Memory::disabled(),
        );

        let run = orchestrator.run(task(), CancellationToken::new()).await;

        assert_eq!(*run.task.status(), TaskStatus::Succeeded);
        assert_eq!(run.session.iteration(), 1);
        // plan, located, patch, exec
        assert_eq!(run.session.messages().len(), 4);
    }

    #[tokio::test]
    async fn retryable_coder_failure_costs_an_iteration() {
        let config = Config {
            enable_critic: false,
            enable_reviewer: false,
            ..Config::default()
        };
        let orchestrator = Orchestrator::new(
            &config,
            registry(Script {
                planner: vec![PLAN],
                locator: vec![LOCATED],
                coder: vec!["not a patch at all", PATCH],
                critic: vec![],
                reviewer: vec![],
                sandbox: vec![execution(0)],
            }),
            Memory::disabled(),
        );

        let run = orchestrator.run(task(), CancellationToken::new()).await;

        assert_eq!(*run.task.status(), TaskStatus::Succeeded);
        assert_eq!(run.session.iteration(), 2);
        assert!(run
            .session
            .messages()
            .iter()
            .any(|m| matches!(m.payload, AgentPayload::Failure { .. })));
    }

    #[tokio::test]
    async fn sandbox_infrastructure_failure_is_fatal() {
        let config = Config::default();
        let orchestrator = Orchestrator::new(
            &config,
            registry(Script {
                planner: vec![PLAN],
                locator: vec![LOCATED],
                coder: vec![PATCH],
                critic: vec![],
                reviewer: vec![],
                sandbox: vec![Err(SandboxError::Infrastructure("backend down".to_string()))],
            }),
            Memory::disabled(),
        );

        let run = orchestrator.run(task(), CancellationToken::new()).await;

        let TaskStatus::Failed { reason } = run.task.status() else {
            panic!("expected failure, got {:?}", run.task.status());
        };
        assert!(reason.contains("executor"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_hanging_turn() {
        struct HangingPlanner;

        #[async_trait::async_trait]
        impl Agent for HangingPlanner {
            fn role(&self) -> AgentRole {
                AgentRole::Planner
            }

            async fn handle(&self, _session: &Session) -> Result<AgentOutput, AgentError> {
                futures::future::pending().await
            }
        }

        let config = Config::default();
        let mut reg = AgentRegistry::new(Duration::from_secs(60));
        reg.register(Arc::new(HangingPlanner));
        let orchestrator = Orchestrator::new(&config, reg, Memory::disabled());

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };

        let run = orchestrator.run(task(), cancel).await;
        handle.await.unwrap();

        assert_eq!(*run.task.status(), TaskStatus::Cancelled);
        assert!(run.session.messages().is_empty());
    }

    #[tokio::test]
    async fn success_is_stored_in_memory() {
        let store = SqliteMemoryStore::open_in_memory(Arc::new(HashEmbedder::new(64)))
            .await
            .unwrap();
        let memory = Memory::new(Arc::new(store), Duration::from_secs(1));

        let config = Config {
            enable_critic: false,
            enable_reviewer: false,
            ..Config::default()
        };
        let orchestrator = Orchestrator::new(
            &config,
            registry(Script {
                planner: vec![PLAN],
                locator: vec![LOCATED],
                coder: vec![PATCH],
                critic: vec![],
                reviewer: vec![],
                sandbox: vec![execution(0)],
            }),
            memory.clone(),
        );

        let run = orchestrator.run(task(), CancellationToken::new()).await;
        assert_eq!(*run.task.status(), TaskStatus::Succeeded);

        let records = memory
            .retrieve("pagination shows one page too few", 1)
            .await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].patch.path(), "pagination.py");
    }
}
