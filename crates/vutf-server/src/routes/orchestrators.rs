//! Orchestrator management routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use vutf_core::service::OrchestratorSummary;
use vutf_core::{ExecuteRequest, ExecutionStatus, OrchestratorConfig, OrchestratorType};

use super::{api_error, not_found};
use crate::middleware::UserContext;
use crate::state::AppState;

/// Create orchestrator router
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orchestrators", post(create_orchestrator))
        .route(
            "/orchestrators/{id}",
            get(get_orchestrator).delete(delete_orchestrator),
        )
        .route("/orchestrators/{id}/executions", post(execute))
}

#[derive(Debug, Deserialize)]
pub struct CreateOrchestratorRequest {
    #[serde(rename = "type")]
    pub orchestrator_type: OrchestratorType,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct ExecutionAccepted {
    pub execution_id: String,
    pub orchestrator_id: String,
    pub status: ExecutionStatus,
}

/// Orchestrator `id` if it belongs to the caller
async fn owned_orchestrator(
    state: &AppState,
    ctx: &UserContext,
    id: &str,
) -> Result<OrchestratorSummary, (StatusCode, String)> {
    let summary = state.service.get_orchestrator(id).await.map_err(api_error)?;
    if summary.user != ctx.user {
        return Err(not_found("Orchestrator"));
    }
    Ok(summary)
}

/// Create (or reuse) an orchestrator for the caller
pub async fn create_orchestrator(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<UserContext>,
    Json(req): Json<CreateOrchestratorRequest>,
) -> Result<(StatusCode, Json<OrchestratorSummary>), (StatusCode, String)> {
    let config = OrchestratorConfig {
        orchestrator_type: req.orchestrator_type,
        parameters: req.parameters,
        user: ctx.user,
    };

    let id = state
        .service
        .create_orchestrator(config)
        .await
        .map_err(api_error)?;
    let summary = state.service.get_orchestrator(&id).await.map_err(api_error)?;

    Ok((StatusCode::CREATED, Json(summary)))
}

/// Get an orchestrator by ID
pub async fn get_orchestrator(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<UserContext>,
    Path(id): Path<String>,
) -> Result<Json<OrchestratorSummary>, (StatusCode, String)> {
    owned_orchestrator(&state, &ctx, &id).await.map(Json)
}

/// Tear down an orchestrator
pub async fn delete_orchestrator(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<UserContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    owned_orchestrator(&state, &ctx, &id).await?;
    state.service.teardown_orchestrator(&id).await.map_err(api_error)?;
    info!(orchestrator_id = %id, user = %ctx.user, "Orchestrator deleted via API");
    Ok(StatusCode::NO_CONTENT)
}

/// Dispatch a run. Responds as soon as the run is recorded.
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<UserContext>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<ExecutionAccepted>), (StatusCode, String)> {
    owned_orchestrator(&state, &ctx, &id).await?;

    let execution_id = state.service.execute(&id, req).await.map_err(api_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ExecutionAccepted {
            execution_id,
            orchestrator_id: id,
            status: ExecutionStatus::Created,
        }),
    ))
}
