//! HTTP/WS transport: project CRUD, mission kickoff, agent queries, and the
//! WebSocket feed that forwards every broadcast event to connected clients.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use alch_agents::manager::AgentManager;
use alch_bridge::{Event, EventBus, EventKind};
use alch_core::memory::MemoryDir;
use alch_core::project::{init_project_layout, Project, ProjectStore};
use alch_core::scanner;
use alch_core::types::AgentSummary;
use alch_core::worktree::{GitRunner, RealGitRunner};
use alch_llm::{ChatClient, MistralClient};
use alch_mission::MissionPipeline;

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub store: ProjectStore,
    pub manager: Arc<AgentManager>,
    pub bus: EventBus,
    pub pipeline: Arc<MissionPipeline>,
    pub git: Arc<dyn GitRunner>,
}

impl AppState {
    /// Production wiring: real git, real Mistral client, default registry.
    pub fn new() -> Self {
        let store = ProjectStore::default_location();
        let manager = Arc::new(AgentManager::new());
        let bus = EventBus::new();
        let llm: Arc<dyn ChatClient> = Arc::new(MistralClient::new());
        let git: Arc<dyn GitRunner> = Arc::new(RealGitRunner);
        Self::with_parts(store, manager, bus, llm, git, Duration::from_secs(1))
    }

    /// Fully injected wiring (for testing).
    pub fn with_parts(
        store: ProjectStore,
        manager: Arc<AgentManager>,
        bus: EventBus,
        llm: Arc<dyn ChatClient>,
        git: Arc<dyn GitRunner>,
        poll_interval: Duration,
    ) -> Self {
        let pipeline = Arc::new(MissionPipeline::with_parts(
            store.clone(),
            Arc::clone(&manager),
            bus.clone(),
            llm,
            Arc::clone(&git),
            poll_interval,
        ));
        Self {
            store,
            manager,
            bus,
            pipeline,
            git,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ApiError
// ---------------------------------------------------------------------------

/// JSON error body with a status code, matching the transport contract:
/// client input errors surface as 4xx with a `detail` field.
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"detail": self.detail}))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:5173"),
            HeaderValue::from_static("http://localhost:5174"),
            HeaderValue::from_static("http://127.0.0.1:5173"),
            HeaderValue::from_static("http://127.0.0.1:5174"),
        ])
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{id}", get(get_project).delete(delete_project))
        .route("/api/projects/{id}/mission", post(start_mission))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{id}", get(get_agent))
        .route("/api/agents/{id}/kill", post(kill_agent))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateProjectRequest {
    name: String,
    /// "clone" | "local" | "init"
    source: String,
    repo_url: Option<String>,
    local_path: Option<String>,
    #[serde(default = "default_adapter")]
    cli_adapter: String,
}

fn default_adapter() -> String {
    "vibe".into()
}

async fn list_projects(State(state): State<AppState>) -> Result<Json<Vec<Project>>, ApiError> {
    state.store.load().map(Json).map_err(ApiError::internal)
}

async fn create_project(
    State(state): State<AppState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<Project>, ApiError> {
    let local_path = match req.source.as_str() {
        "local" => {
            let path = req
                .local_path
                .ok_or_else(|| ApiError::bad_request("local_path required for local source"))?;
            if !FsPath::new(&path).exists() {
                return Err(ApiError::bad_request(format!("Path does not exist: {path}")));
            }
            path
        }
        "init" => {
            let path = req
                .local_path
                .ok_or_else(|| ApiError::bad_request("local_path required for init source"))?;
            std::fs::create_dir_all(&path).map_err(ApiError::internal)?;
            let output = state
                .git
                .run_git(FsPath::new(&path), &["init"])
                .await
                .map_err(ApiError::internal)?;
            if !output.success {
                return Err(ApiError::internal(format!(
                    "git init failed: {}",
                    output.stderr
                )));
            }
            path
        }
        "clone" => {
            let repo_url = req
                .repo_url
                .ok_or_else(|| ApiError::bad_request("repo_url required for clone source"))?;
            let repo_name = repo_url
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or("repo")
                .trim_end_matches(".git")
                .to_string();
            let parent = dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("alchemistral-projects");
            std::fs::create_dir_all(&parent).map_err(ApiError::internal)?;
            let target = parent.join(&repo_name);
            let target_str = target.to_string_lossy().to_string();
            let output = state
                .git
                .run_git(&parent, &["clone", &repo_url, &target_str])
                .await
                .map_err(ApiError::internal)?;
            if !output.success {
                return Err(ApiError::internal(format!(
                    "git clone failed: {}",
                    output.stderr
                )));
            }
            target_str
        }
        other => {
            return Err(ApiError::bad_request(format!("unknown source: {other}")));
        }
    };

    init_project_layout(&local_path).map_err(ApiError::internal)?;
    run_scan(&state, &local_path).await;

    let project = state
        .store
        .add(Project::new(req.name, local_path, req.cli_adapter))
        .map_err(ApiError::internal)?;
    Ok(Json(project))
}

/// One-shot codebase scan at import time, with progress events on the bus.
async fn run_scan(state: &AppState, local_path: &str) {
    state.bus.publish(
        Event::orchestrator(EventKind::Scanning).with_text("Scanning codebase..."),
    );

    let root = PathBuf::from(local_path);
    match tokio::task::spawn_blocking(move || scanner::scan_project(&root)).await {
        Ok(Ok(report)) => {
            state.bus.publish(
                Event::orchestrator(EventKind::FilesUpdated)
                    .with("count", report.file_count)
                    .with_text(format!("Scanned {} files", report.file_count)),
            );
            state.bus.publish(
                Event::orchestrator(EventKind::ScanComplete)
                    .with("stack", report.stack.clone())
                    .with_text("Codebase scan complete"),
            );
        }
        Ok(Err(err)) => warn!(error = %err, "codebase scan failed"),
        Err(err) => warn!(error = %err, "codebase scan task failed"),
    }
}

async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    state
        .store
        .get(&id)
        .map_err(ApiError::internal)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Project not found: {id}")))
}

async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.store.remove(&id).map_err(ApiError::internal)? {
        Ok(Json(json!({"status": "deleted", "id": id})))
    } else {
        Err(ApiError::not_found(format!("Project not found: {id}")))
    }
}

// ---------------------------------------------------------------------------
// Mission
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct MessageRequest {
    message: String,
}

/// Fire-and-forget: the pipeline runs in the background and streams events
/// over the WebSocket.
async fn start_mission(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<Value>, ApiError> {
    let project = state
        .store
        .get(&id)
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found(format!("Project not found: {id}")))?;
    if !MemoryDir::new(&project.local_path).exists() {
        return Err(ApiError::not_found(
            ".alchemistral/ directory not found in project",
        ));
    }

    info!(project_id = %id, "mission started");
    let pipeline = Arc::clone(&state.pipeline);
    tokio::spawn(async move {
        pipeline.run_mission(&id, &req.message).await;
    });

    Ok(Json(json!({"status": "started"})))
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AgentQuery {
    project_id: Option<String>,
}

async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> Json<Vec<AgentSummary>> {
    Json(state.manager.list_agents(query.project_id.as_deref()).await)
}

async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentSummary>, ApiError> {
    state
        .manager
        .get_agent(&id, None)
        .await
        .map(|s| Json(s.summary()))
        .ok_or_else(|| ApiError::not_found(format!("Agent not found: {id}")))
}

async fn kill_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.manager.kill_agent(&id).await {
        Ok(Json(json!({"status": "killed", "agent_id": id})))
    } else {
        Err(ApiError::not_found(format!("Agent not found: {id}")))
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let greeting = Event::orchestrator(EventKind::Status).with_text("Alchemistral online");
    let Ok(greeting_json) = serde_json::to_string(&greeting) else {
        return;
    };
    if socket.send(Message::Text(greeting_json.into())).await.is_err() {
        return;
    }

    let events = state.bus.subscribe();
    loop {
        tokio::select! {
            event = events.recv_async() => {
                let Ok(event) = event else { break };
                let Ok(json) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                // Clients only listen; any close or transport error ends the
                // session.
                match incoming {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
