//! Application state.

use std::sync::Arc;
use std::time::Instant;

use vutf_core::OrchestratorService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// Orchestrator execution core
    pub service: Arc<OrchestratorService>,
    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    /// Create new application state
    pub fn new(config: Config, service: Arc<OrchestratorService>) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            service,
            start_time: Instant::now(),
        })
    }
}
