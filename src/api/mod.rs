//! HTTP API for task submission and observation.
//!
//! Endpoints:
//! - `POST /tasks` - submit a bug report, returns the task id immediately
//! - `GET /tasks/:id` - status summary
//! - `GET /tasks/:id/history` - full session transcript
//! - `POST /tasks/:id/cancel` - request cancellation
//! - `GET /health` - liveness probe
//!
//! Submission spawns the orchestrator run on a background task; the record
//! in the task map is refreshed at every turn boundary, so reads never block
//! on a running pipeline.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::agents::build_registry;
use crate::config::{Config, TaskOverrides};
use crate::llm::LlmClient;
use crate::memory::Memory;
use crate::orchestrator::Orchestrator;
use crate::sandbox::SandboxManager;
use crate::task::{AgentMessage, Session, Task, TaskContext, TaskStatus};

/// Live view of one submitted task.
pub struct TaskRecord {
    pub task: Task,
    pub session: Session,
    cancel: CancellationToken,
}

type TaskMap = Arc<RwLock<HashMap<Uuid, Arc<RwLock<TaskRecord>>>>>;

/// Shared server state: the long-lived subsystems plus the task map.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    llm: Arc<dyn LlmClient>,
    sandbox: Arc<SandboxManager>,
    memory: Memory,
    tasks: TaskMap,
}

impl AppState {
    pub fn new(
        config: Config,
        llm: Arc<dyn LlmClient>,
        sandbox: Arc<SandboxManager>,
        memory: Memory,
    ) -> Self {
        Self {
            config: Arc::new(config),
            llm,
            sandbox,
            memory,
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn record(&self, id: Uuid) -> Option<Arc<RwLock<TaskRecord>>> {
        match self.tasks.read() {
            Ok(tasks) => tasks.get(&id).cloned(),
            Err(e) => {
                tracing::error!("Task map lock poisoned: {}", e);
                None
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct SubmitTask {
    pub bug_report: String,
    #[serde(default)]
    pub context: TaskContext,
    #[serde(default)]
    pub overrides: TaskOverrides,
}

#[derive(Debug, Serialize)]
struct TaskView {
    id: Uuid,
    status: TaskStatus,
    iteration: u32,
    turns: usize,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl TaskView {
    fn from_record(record: &TaskRecord) -> Self {
        Self {
            id: record.task.id().as_uuid(),
            status: record.task.status().clone(),
            iteration: record.session.iteration(),
            turns: record.session.messages().len(),
            created_at: record.task.created_at(),
        }
    }
}

fn update_record(record: &RwLock<TaskRecord>, task: &Task, session: &Session) {
    match record.write() {
        Ok(mut guard) => {
            guard.task = task.clone();
            guard.session = session.clone();
        }
        Err(e) => tracing::error!("Task record lock poisoned: {}", e),
    }
}

async fn submit_task(State(state): State<AppState>, Json(body): Json<SubmitTask>) -> Response {
    let task = match Task::new(body.bug_report, body.context) {
        Ok(task) => task,
        Err(e) => return error(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let config = match state.config.with_overrides(&body.overrides) {
        Ok(config) => config,
        Err(e) => return error(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let id = task.id().as_uuid();
    let cancel = CancellationToken::new();
    let record = Arc::new(RwLock::new(TaskRecord {
        task: task.clone(),
        session: Session::new(&task),
        cancel: cancel.clone(),
    }));
    match state.tasks.write() {
        Ok(mut tasks) => {
            tasks.insert(id, record.clone());
        }
        Err(e) => {
            tracing::error!("Task map lock poisoned: {}", e);
            return error(StatusCode::INTERNAL_SERVER_ERROR, "task map unavailable");
        }
    }

    let registry = build_registry(state.llm.clone(), state.sandbox.clone(), &config);
    let orchestrator = Orchestrator::new(&config, registry, state.memory.clone());
    tokio::spawn(async move {
        let run = orchestrator
            .run_observed(task, cancel, |task, session| {
                update_record(&record, task, session);
            })
            .await;
        update_record(&record, &run.task, &run.session);
        tracing::info!(task_id = %run.task.id(), status = ?run.task.status(), "Task finished");
    });

    (StatusCode::ACCEPTED, Json(json!({ "id": id }))).into_response()
}

async fn get_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let Some(record) = state.record(id) else {
        return error(StatusCode::NOT_FOUND, format!("no task {}", id));
    };
    let response = match record.read() {
        Ok(guard) => Json(TaskView::from_record(&guard)).into_response(),
        Err(e) => {
            tracing::error!("Task record lock poisoned: {}", e);
            error(StatusCode::INTERNAL_SERVER_ERROR, "task record unavailable")
        }
    };
    response
}

async fn get_task_history(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let Some(record) = state.record(id) else {
        return error(StatusCode::NOT_FOUND, format!("no task {}", id));
    };
    let response = match record.read() {
        Ok(guard) => {
            let messages: Vec<AgentMessage> = guard.session.messages().to_vec();
            Json(json!({ "id": id, "messages": messages })).into_response()
        }
        Err(e) => {
            tracing::error!("Task record lock poisoned: {}", e);
            error(StatusCode::INTERNAL_SERVER_ERROR, "task record unavailable")
        }
    };
    response
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let Some(record) = state.record(id) else {
        return error(StatusCode::NOT_FOUND, format!("no task {}", id));
    };
    let response = match record.read() {
        Ok(guard) => {
            if guard.task.status().is_terminal() {
                return error(
                    StatusCode::CONFLICT,
                    format!("task is already {:?}", guard.task.status()),
                );
            }
            guard.cancel.cancel();
            (StatusCode::ACCEPTED, Json(json!({ "id": id }))).into_response()
        }
        Err(e) => {
            tracing::error!("Task record lock poisoned: {}", e);
            error(StatusCode::INTERNAL_SERVER_ERROR, "task record unavailable")
        }
    };
    response
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(submit_task))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/history", get(get_task_history))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
