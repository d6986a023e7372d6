//! Health check endpoint.

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;
use vutf_core::pool::PoolStats;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub pool: PoolStats,
    pub pool_capacity: usize,
    pub open_store_handles: usize,
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        pool: state.service.pool_stats(),
        pool_capacity: state.config.core.pool.max_instances,
        open_store_handles: state.service.connections().open_handles().await,
    })
}
