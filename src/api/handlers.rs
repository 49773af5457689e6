use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::shell::ShellState;
use crate::workspace::{self, tree::{self, TreeNode}};

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct ServiceInfo {
    service: &'static str,
    version: &'static str,
}

pub(super) async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: "sandshell",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
pub(super) struct TreeResponse {
    tree: TreeNode,
}

pub(super) async fn files(State(state): State<AppState>) -> Result<Json<TreeResponse>, ApiError> {
    let root = state.workspace.root().to_path_buf();
    let tree = tokio::task::spawn_blocking(move || tree::snapshot(&root))
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?
        .map_err(|e| {
            tracing::warn!(error = %e, "failed to snapshot workspace");
            ApiError::InternalError("failed to list workspace".into())
        })?;
    Ok(Json(TreeResponse { tree }))
}

#[derive(Deserialize)]
pub(super) struct ContentQuery {
    path: Option<String>,
}

#[derive(Serialize)]
pub(super) struct ContentResponse {
    content: String,
}

pub(super) async fn file_content(
    State(state): State<AppState>,
    Query(query): Query<ContentQuery>,
) -> Result<Json<ContentResponse>, ApiError> {
    let raw = query
        .path
        .ok_or_else(|| ApiError::InvalidRequest("missing path parameter".into()))?;
    let path = state.workspace.resolve(&raw).map_err(|e| {
        tracing::warn!(path = %raw, "rejected file read outside workspace");
        ApiError::from(e)
    })?;
    let content = workspace::read_file(&path, &raw).await?;
    Ok(Json(ContentResponse { content }))
}

#[derive(Serialize)]
pub(super) struct SessionResponse {
    #[serde(flatten)]
    state: ShellState,
    pid: Option<u32>,
    command: String,
    connections: usize,
}

pub(super) async fn session_status(State(state): State<AppState>) -> Json<SessionResponse> {
    Json(SessionResponse {
        state: state.shell.state(),
        pid: state.shell.pid,
        command: state.shell.command.clone(),
        connections: state.ws_count.load(std::sync::atomic::Ordering::Acquire),
    })
}
