//! Execution sandbox: isolated, resource-limited runs of candidate fixes.
//!
//! The [`SandboxManager`] is the one shared resource pool across tasks. It
//! enforces two concurrency rules:
//! - a system-wide admission limit on concurrent executions (semaphore)
//! - at most one execution in flight per session (per-task mutex)
//!
//! Backends implement [`SandboxBackend`]. Resource-limit violations
//! (CPU/memory/process/wall-clock) are *normal* execution outcomes reported
//! in [`ExecutionResult`]; only backend unavailability is an error.

mod local;

pub use local::LocalSandbox;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};

use crate::config::SandboxConfig;
use crate::task::{ExecutionResult, Patch, TaskId};

/// Errors from the sandbox subsystem.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    /// The backend itself is unavailable (cannot create the execution dir,
    /// cannot spawn processes). Fatal to the task.
    #[error("sandbox backend unavailable: {0}")]
    Infrastructure(String),

    /// The patch set cannot be applied. Retryable: the coder is asked to
    /// regenerate.
    #[error("malformed patch: {0}")]
    MalformedPatch(String),
}

/// One execution: a patch set on top of an optional seed tree, plus the
/// command to run and the limits to enforce.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Seed source tree, copied (not mounted) into the fresh execution dir
    pub workspace: Option<PathBuf>,
    /// Patches applied on top of the seed tree
    pub patches: Vec<Patch>,
    /// Test/run command, executed via `/bin/sh -c`
    pub command: String,
    /// Resource limits for this execution
    pub limits: SandboxConfig,
}

/// Contract for an execution backend.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Run the request in a fresh, isolated environment.
    ///
    /// Implementations guarantee that no state persists across invocations
    /// and that the environment has no network access.
    async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError>;
}

/// Admission-controlled front for a [`SandboxBackend`].
pub struct SandboxManager {
    backend: Arc<dyn SandboxBackend>,
    admission: Arc<Semaphore>,
    /// Per-task serialization locks; idle entries are pruned on acquisition.
    sessions: Mutex<HashMap<TaskId, Arc<Mutex<()>>>>,
}

impl SandboxManager {
    pub fn new(backend: Arc<dyn SandboxBackend>, max_concurrent: usize) -> Self {
        Self {
            backend,
            admission: Arc::new(Semaphore::new(max_concurrent.max(1))),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn session_lock(&self, task_id: TaskId) -> Arc<Mutex<()>> {
        let mut sessions = self.sessions.lock().await;
        // A strong count of 1 means only the map holds the lock: no
        // execution for that task is in flight or waiting.
        sessions.retain(|id, lock| *id == task_id || Arc::strong_count(lock) > 1);
        Arc::clone(sessions.entry(task_id).or_default())
    }

    #[cfg(test)]
    async fn session_lock_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Run an execution for the given task.
    ///
    /// Invocations for the same task are serialized; across tasks, at most
    /// `max_concurrent` executions run at once.
    pub async fn run(
        &self,
        task_id: TaskId,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        let lock = self.session_lock(task_id).await;
        let _serialized = lock.lock().await;
        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| SandboxError::Infrastructure("admission pool closed".to_string()))?;

        self.backend.run(request).await
    }
}

/// Scripted backend that replays canned results in order (for testing).
pub struct ScriptedSandbox {
    results: std::sync::Mutex<std::collections::VecDeque<Result<ExecutionResult, SandboxError>>>,
}

impl ScriptedSandbox {
    pub fn new(results: Vec<Result<ExecutionResult, SandboxError>>) -> Self {
        Self {
            results: std::sync::Mutex::new(results.into()),
        }
    }
}

#[async_trait]
impl SandboxBackend for ScriptedSandbox {
    async fn run(&self, _request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        self.results
            .lock()
            .expect("scripted results poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                Err(SandboxError::Infrastructure(
                    "scripted results exhausted".to_string(),
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ExitStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn passing_result() -> ExecutionResult {
        ExecutionResult {
            exit: ExitStatus::Exited { code: 0 },
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
            resource_limit_violation: false,
            tests: None,
        }
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            workspace: None,
            patches: vec![],
            command: "true".to_string(),
            limits: SandboxConfig::default(),
        }
    }

    /// Backend that records its peak concurrency.
    struct ConcurrencyMeter {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SandboxBackend for ConcurrencyMeter {
        async fn run(&self, _request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(passing_result())
        }
    }

    #[tokio::test]
    async fn admission_limit_bounds_concurrency() {
        let meter = Arc::new(ConcurrencyMeter {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let manager = Arc::new(SandboxManager::new(meter.clone(), 2));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.run(TaskId::new(), &request()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(meter.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn same_task_executions_are_serialized() {
        let meter = Arc::new(ConcurrencyMeter {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        // Admission would allow 4 at once; the per-session lock must not.
        let manager = Arc::new(SandboxManager::new(meter.clone(), 4));
        let task_id = TaskId::new();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.run(task_id, &request()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(meter.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finished_session_locks_are_pruned() {
        let backend = ScriptedSandbox::new(vec![
            Ok(passing_result()),
            Ok(passing_result()),
            Ok(passing_result()),
        ]);
        let manager = SandboxManager::new(Arc::new(backend), 2);

        manager.run(TaskId::new(), &request()).await.unwrap();
        manager.run(TaskId::new(), &request()).await.unwrap();
        manager.run(TaskId::new(), &request()).await.unwrap();

        // The third acquisition pruned the two idle entries.
        assert_eq!(manager.session_lock_count().await, 1);
    }

    #[tokio::test]
    async fn scripted_backend_replays_in_order() {
        let backend = ScriptedSandbox::new(vec![
            Ok(passing_result()),
            Err(SandboxError::Infrastructure("down".to_string())),
        ]);
        let manager = SandboxManager::new(Arc::new(backend), 1);
        let task_id = TaskId::new();

        assert!(manager.run(task_id, &request()).await.is_ok());
        assert!(matches!(
            manager.run(task_id, &request()).await,
            Err(SandboxError::Infrastructure(_))
        ));
    }
}
