//! Core Configuration
//!
//! Tunables for the per-user stores, the orchestrator pool, the retry
//! policies and run execution. Every limit lives here so deployments can
//! change them without touching code.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ExecutionMode;

/// Core configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Per-user store configuration
    pub store: StoreConfig,

    /// Orchestrator pool configuration
    pub pool: PoolConfig,

    /// Retry policies per execution mode
    pub retry: RetryConfig,

    /// Run execution configuration
    pub execution: ExecutionConfig,

    /// API gateway configuration
    pub gateway: GatewayConfig,
}

/// Per-user store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one store file per user
    pub store_dir: PathBuf,

    /// Deployment-wide salt mixed into every store path
    pub salt: String,

    /// How long SQLite waits on a held lock before reporting busy (default: 0)
    pub busy_timeout_ms: u64,

    /// Idle time after which unreferenced handles are closed (default: 600)
    pub max_idle_secs: u64,

    /// Accept a salt that differs from the recorded fingerprint (default: false)
    pub allow_salt_rotation: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("stores"),
            salt: String::new(),
            busy_timeout_ms: 0,
            max_idle_secs: 600, // 10 minutes
            allow_salt_rotation: false,
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

/// Orchestrator pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum cached orchestrator instances (default: 20)
    pub max_instances: usize,

    /// Instance time-to-live in seconds (default: 1800 = 30 minutes)
    pub ttl_secs: u64,

    /// Interval between expiry sweeps in seconds (default: 60)
    pub sweep_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 20,
            ttl_secs: 1800,
            sweep_interval_secs: 60,
        }
    }
}

impl PoolConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Retry policy for a single execution mode
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry, doubled on each subsequent one
    pub base_delay_ms: u64,

    /// Pause between consecutive prompt deliveries
    pub inter_item_delay_ms: u64,
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn inter_item_delay(&self) -> Duration {
        Duration::from_millis(self.inter_item_delay_ms)
    }
}

/// Retry policies per execution mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Interactive runs favor fast feedback
    pub test: RetryPolicy,

    /// Bulk runs favor eventual success
    pub full: RetryPolicy,

    /// Ceiling for any single backoff wait (default: 60000)
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            test: RetryPolicy {
                max_retries: 2,
                base_delay_ms: 500,
                inter_item_delay_ms: 200,
            },
            full: RetryPolicy {
                max_retries: 5,
                base_delay_ms: 2000,
                inter_item_delay_ms: 500,
            },
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    /// Policy for the given execution mode
    pub fn policy(&self, mode: ExecutionMode) -> RetryPolicy {
        match mode {
            ExecutionMode::Test => self.test,
            ExecutionMode::Full => self.full,
        }
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Run execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Wall-clock ceiling for a whole run in seconds (default: 3600)
    pub run_timeout_secs: u64,

    /// Concurrent deliveries within one run when not configured (default: 1)
    pub default_concurrency: usize,

    /// Characters of the response kept for score de-duplication (default: 100)
    pub text_prefix_len: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: 3600,
            default_concurrency: 1,
            text_prefix_len: 100,
        }
    }
}

impl ExecutionConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

/// API gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base URL of the API gateway
    pub base_url: String,

    /// Per-request timeout in milliseconds (default: 60000)
    pub request_timeout_ms: u64,

    /// Optional key forwarded to the gateway
    pub api_key: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9080".to_string(),
            request_timeout_ms: 60_000,
            api_key: None,
        }
    }
}

impl CoreConfig {
    /// Create a config with the given store directory and salt
    pub fn new(store_dir: impl Into<PathBuf>, salt: impl Into<String>) -> Self {
        Self {
            store: StoreConfig {
                store_dir: store_dir.into(),
                salt: salt.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Set pool configuration
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set retry configuration
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set execution configuration
    pub fn with_execution(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }

    /// Set gateway configuration
    pub fn with_gateway(mut self, gateway: GatewayConfig) -> Self {
        self.gateway = gateway;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.store.salt.is_empty() {
            return Err(ConfigValidationError::MissingSalt);
        }

        if self.store.store_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::InvalidValue {
                field: "store.store_dir".into(),
                message: "must not be empty".into(),
            });
        }

        if self.pool.max_instances == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pool.max_instances".into(),
                message: "must be greater than 0".into(),
            });
        }

        if self.pool.ttl_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pool.ttl_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        if self.execution.default_concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "execution.default_concurrency".into(),
                message: "must be greater than 0".into(),
            });
        }

        if self.execution.run_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "execution.run_timeout_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("store.salt is required")]
    MissingSalt,

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
