//! Execution routes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use vutf_core::{ExecutionFilters, ExecutionRun, ExecutionStatusReport};

use super::{api_error, not_found};
use crate::middleware::UserContext;
use crate::state::AppState;

/// Create execution router
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/executions", get(list_executions))
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/cancel", post(cancel_execution))
}

#[derive(Debug, Serialize)]
pub struct ExecutionList {
    pub executions: Vec<ExecutionRun>,
    pub completion_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub execution_id: String,
    pub cancelled: bool,
}

async fn ensure_owner(
    state: &AppState,
    ctx: &UserContext,
    execution_id: &str,
) -> Result<(), (StatusCode, String)> {
    let owner = state
        .service
        .execution_owner(execution_id)
        .await
        .map_err(api_error)?;
    if owner != ctx.user {
        return Err(not_found("ExecutionRun"));
    }
    Ok(())
}

/// List the caller's runs
pub async fn list_executions(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<UserContext>,
    Query(filters): Query<ExecutionFilters>,
) -> Result<Json<ExecutionList>, (StatusCode, String)> {
    let executions = state
        .service
        .list_executions(&ctx.user, &filters)
        .await
        .map_err(api_error)?;
    let completion_rate = state
        .service
        .completion_rate(&ctx.user, &filters)
        .await
        .map_err(api_error)?;

    Ok(Json(ExecutionList {
        executions,
        completion_rate,
    }))
}

/// Status, completion and scores of one run
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<UserContext>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionStatusReport>, (StatusCode, String)> {
    ensure_owner(&state, &ctx, &id).await?;
    let report = state
        .service
        .get_execution_status(&id)
        .await
        .map_err(api_error)?;
    Ok(Json(report))
}

/// Request cancellation of a run
pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<UserContext>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    ensure_owner(&state, &ctx, &id).await?;
    let cancelled = state.service.cancel(&id).await.map_err(api_error)?;
    Ok(Json(CancelResponse {
        execution_id: id,
        cancelled,
    }))
}
