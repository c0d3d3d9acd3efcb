use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use ws_orchestrator::{CreateWorkspaceRequest, LogOptions};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/workspaces", get(list_workspaces).post(create_workspace))
        .route(
            "/workspaces/{id}",
            get(get_workspace).delete(delete_workspace),
        )
        .route("/workspaces/{id}/start", post(start_workspace))
        .route("/workspaces/{id}/stop", post(stop_workspace))
        .route("/workspaces/{id}/repair", post(repair_workspace))
        .route("/workspaces/{id}/restart", post(restart_workspace))
        .route("/workspaces/{id}/logs", get(workspace_logs))
        .route("/workspaces/{id}/status", get(workspace_status))
}

async fn create_workspace(
    State(state): State<AppState>,
    payload: Result<Json<CreateWorkspaceRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(req) = payload.map_err(ApiError::from)?;

    let workspace = state.controller.create(req).await?;

    Ok(Json(json!({ "success": true, "workspace": workspace })))
}

async fn list_workspaces(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let workspaces = state.controller.list().await?;

    Ok(Json(json!({ "workspaces": workspaces })))
}

async fn get_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let workspace = state.controller.get(&id).await?;

    Ok(Json(json!({ "workspace": workspace })))
}

async fn delete_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let message = if state.controller.delete(&id).await? {
        format!("Workspace {} deleted", id)
    } else {
        format!("Workspace {} was already deleted", id)
    };

    Ok(Json(json!({ "success": true, "message": message })))
}

async fn start_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let workspace_state = state.controller.start(&id).await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Workspace {} started", id),
        "state": workspace_state,
    })))
}

async fn stop_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let workspace_state = state.controller.stop(&id).await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Workspace {} stopped", id),
        "state": workspace_state,
    })))
}

async fn repair_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let workspace = state.controller.repair(&id).await?;

    Ok(Json(json!({ "success": true, "workspace": workspace })))
}

async fn restart_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let workspace_state = state.controller.restart(&id).await?;

    Ok(Json(json!({
        "success": true,
        "message": format!("Workspace {} restart initiated", id),
        "state": workspace_state,
    })))
}

/// `?lines=N&container=NAME`; defaults to the last 100 lines of the
/// workspace container
async fn workspace_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<LogOptions>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(options) = query.map_err(ApiError::from)?;

    let logs = state.controller.logs(&id, &options).await?;

    Ok(Json(json!({
        "success": true,
        "logs": logs.logs,
        "pod": logs.pod,
        "container": logs.container,
        "namespace": logs.namespace,
    })))
}

async fn workspace_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let status = state.controller.status(&id).await?;

    Ok(Json(json!({ "success": true, "status": status })))
}
