//! vutf-core - Orchestrator execution core for ViolentUTF
//!
//! Creates, reuses and tears down orchestrators, keeps exactly one store per
//! user, retries prompt deliveries under provider throttling and tracks
//! batch progress without over- or under-reporting completion.
//!
//! - **resolver** - UserIdentity -> store path (salted, deterministic)
//! - **connection** - at most one open store handle per path
//! - **pool** - orchestrator instances keyed by canonical config, TTL + LRU
//! - **retry** - exponential backoff with mode-specific policies
//! - **tracker** - score de-duplication and per-run completion
//! - **service** - the façade the API layer calls
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vutf_core::{
//!     CoreConfig, ExecuteRequest, ExecutionMode, OrchestratorConfig, OrchestratorService,
//!     OrchestratorType, UserIdentity, target::ScriptedTarget,
//! };
//!
//! async fn example() -> vutf_core::Result<()> {
//!     let config = CoreConfig::new("/var/lib/violentutf/stores", "deployment-salt");
//!     let service = Arc::new(OrchestratorService::new(config, Arc::new(ScriptedTarget::new()))?);
//!
//!     let alice = UserIdentity::parse("alice")?;
//!     let orchestrator = OrchestratorConfig::new(OrchestratorType::PromptSend, alice)
//!         .with_param("dataset", serde_json::json!("d1"));
//!     let id = service.create_orchestrator(orchestrator).await?;
//!
//!     let execution_id = service
//!         .execute(&id, ExecuteRequest {
//!             prompts: vec!["hello".into()],
//!             mode: ExecutionMode::Test,
//!             batch: None,
//!         })
//!         .await?;
//!     let status = service.get_execution_status(&execution_id).await?;
//!     println!("{} {}", status.status, status.completion_rate);
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod orchestrator;
pub mod pool;
pub mod resolver;
pub mod retry;
pub mod scoring;
pub mod service;
pub mod store;
pub mod target;
pub mod tracker;
pub mod types;

// Re-export commonly used types
pub use config::CoreConfig;
pub use connection::ConnectionManager;
pub use error::{Error, Result};
pub use identity::UserIdentity;
pub use orchestrator::{OrchestratorConfig, OrchestratorInstance, OrchestratorType, PromptInput};
pub use pool::OrchestratorPool;
pub use resolver::UserMemoryResolver;
pub use retry::RetryExecutor;
pub use service::{ExecuteRequest, ExecutionStatusReport, OrchestratorService};
pub use store::{ExecutionFilters, MemoryStoreHandle};
pub use tracker::ExecutionTracker;
pub use types::{BatchSlice, ExecutionMode, ExecutionRun, ExecutionStatus, ScoreRecord};
