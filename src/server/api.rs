use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use berth_common::{FsOperation, HostingType, Workspace};
use berth_runtime::{ProvisioningError, RuntimeError};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error};

use super::SharedState;
use super::auth::Caller;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertWorkspaceRequest {
    #[serde(default)]
    pub hosting_type: HostingType,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub repo_token: Option<String>,
    #[serde(default)]
    pub local_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Timeout(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        let message = err.to_string();
        match err {
            RuntimeError::WorkspaceNotFound(_)
            | RuntimeError::ProxyUnavailable(_)
            | RuntimeError::TerminalUnavailable { .. }
            | RuntimeError::ContainerNotRunning(_) => ApiError::NotFound(message),
            RuntimeError::AgentUnavailable { .. } | RuntimeError::AgentDisconnected { .. } => {
                ApiError::Conflict(message)
            }
            RuntimeError::CommandTimeout { .. } => ApiError::Timeout(message),
            RuntimeError::InvalidPath(_) | RuntimeError::InvalidCommand(_) => {
                ApiError::BadRequest(message)
            }
            RuntimeError::Provisioning(ProvisioningError::EngineUnreachable(_)) => {
                ApiError::Unavailable(message)
            }
            RuntimeError::Provisioning(_)
            | RuntimeError::AgentCommandFailed { .. }
            | RuntimeError::ExecFailed { .. }
            | RuntimeError::Protocol(_) => {
                error!(error = %message, "workspace operation failed");
                ApiError::Internal(message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::NotFound(msg)
            | ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::Conflict(msg)
            | ApiError::Timeout(msg)
            | ApiError::Unavailable(msg)
            | ApiError::Internal(msg) => msg,
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

/// Gate a workspace operation through the access policy.
pub fn authorize(state: &SharedState, caller: &Caller, workspace_id: &str) -> Result<(), ApiError> {
    if state.access.allows(caller.id(), workspace_id) {
        Ok(())
    } else {
        debug!(workspace_id, caller = ?caller.id(), "access denied");
        Err(ApiError::Forbidden(format!(
            "Not allowed to access workspace {}",
            workspace_id
        )))
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route(
            "/api/workspaces/{id}",
            put(upsert_workspace)
                .get(get_workspace)
                .delete(delete_workspace),
        )
        .route("/api/workspaces/{id}/status", get(workspace_status))
        .route("/api/workspaces/{id}/start", post(start_workspace))
        .route("/api/workspaces/{id}/stop", post(stop_workspace))
        .route("/api/workspaces/{id}/restart", post(restart_workspace))
        .route(
            "/api/workspaces/{id}/container",
            axum::routing::delete(remove_container),
        )
        .route("/api/workspaces/{id}/records", get(workspace_records))
        .route("/api/workspaces/{id}/fs", post(workspace_fs))
        .route("/api/workspaces/{id}/exec", post(workspace_exec))
        .route("/api/agent/status", get(agent_status))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn upsert_workspace(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(req): Json<UpsertWorkspaceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &caller, &id)?;
    if id.trim().is_empty() {
        return Err(ApiError::BadRequest("Workspace id must not be empty".into()));
    }
    let workspace = Workspace {
        id: id.clone(),
        owner_id: req.owner_id,
        hosting_type: req.hosting_type,
        repo_url: req.repo_url,
        repo_token: req.repo_token,
        local_port: req.local_port,
    };
    let previous = state.workspaces.upsert(workspace.clone()).await;
    let status = if previous.is_some() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(workspace)))
}

async fn get_workspace(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &caller, &id)?;
    let workspace = state.resolver.workspace(&id).await?;
    Ok(Json(workspace))
}

/// Tear down the container, purge its records, forget the workspace.
async fn delete_workspace(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &caller, &id)?;
    state.resolver.remove(&id, caller.id()).await?;
    state.terminals.close(&id).await;
    state.lifecycle.purge_records(&id).await;
    state.workspaces.remove(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn workspace_status(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &caller, &id)?;
    let status = state.resolver.status(&id, caller.id()).await?;
    Ok(Json(json!({"workspaceId": id, "status": status})))
}

async fn start_workspace(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &caller, &id)?;
    let started = state.resolver.start(&id, caller.id()).await?;
    Ok(Json(started))
}

async fn stop_workspace(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &caller, &id)?;
    state.resolver.stop(&id, caller.id()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_workspace(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &caller, &id)?;
    let started = state.resolver.restart(&id, caller.id()).await?;
    Ok(Json(started))
}

async fn remove_container(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &caller, &id)?;
    state.resolver.remove(&id, caller.id()).await?;
    state.terminals.close(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn workspace_records(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &caller, &id)?;
    let (current, history) = state.lifecycle.records(&id).await;
    Ok(Json(json!({"current": current, "history": history})))
}

async fn workspace_fs(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(op): Json<FsOperation>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &caller, &id)?;
    let outcome = state.resolver.fs(&id, caller.id(), &op).await?;
    Ok(Json(outcome))
}

async fn workspace_exec(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(req): Json<ExecRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &caller, &id)?;
    let out = state.resolver.exec(&id, caller.id(), &req.command).await?;
    Ok(Json(json!({
        "exitCode": out.exit_code,
        "stdout": out.stdout,
        "stderr": out.stderr,
    })))
}

async fn agent_status(State(state): State<SharedState>, caller: Caller) -> impl IntoResponse {
    let connected = caller
        .id()
        .map(|user| state.relay.is_connected(user))
        .unwrap_or(false);
    Json(json!({
        "userId": caller.id(),
        "connected": connected,
        "pendingCommands": state.relay.pending_commands(),
        "openTunnels": state.relay.open_tunnels(),
    }))
}
