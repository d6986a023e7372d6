//! OrchestratorService - the façade external collaborators call.
//!
//! Composes the resolver, connection manager, pool, retry executor and
//! tracker into create / execute / status / teardown operations. Runs are
//! dispatched onto their own task; `execute` returns as soon as the run is
//! recorded as `created`.
//!
//! Everything callers look up by id is read back from the owning user's
//! store, so ids stay valid across restarts. The in-memory tables only cache
//! configs and hold the cancel handles of runs still in flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::cancel::{CancelHandle, CancelToken, cancel_pair};
use crate::config::CoreConfig;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::identity::UserIdentity;
use crate::orchestrator::{
    OrchestratorConfig, OrchestratorInstance, OrchestratorType, PromptInput, RunContext,
};
use crate::pool::{OrchestratorPool, PoolStats};
use crate::resolver::UserMemoryResolver;
use crate::retry::RetryExecutor;
use crate::store::{ExecutionFilters, MemoryStoreHandle, StoredOrchestratorConfig};
use crate::target::PromptTarget;
use crate::tracker::ExecutionTracker;
use crate::types::{
    BatchSlice, BatchSpan, ExecutionCounts, ExecutionMode, ExecutionRun, ExecutionStatus,
    ScoreRecord,
};

/// How long `shutdown` waits for cancelled runs to record their last results
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Work submitted to an orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub prompts: Vec<PromptInput>,
    pub mode: ExecutionMode,
    /// Marks this run as one caller-declared slice of a larger dataset
    #[serde(default)]
    pub batch: Option<BatchSlice>,
}

/// Snapshot of one execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatusReport {
    pub execution_id: String,
    pub orchestrator_id: String,
    pub status: ExecutionStatus,
    pub completion_rate: f64,
    pub is_complete: bool,
    pub counts: ExecutionCounts,
    pub batches_recorded: usize,
    pub expected_batches: Option<u32>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scores: Vec<ScoreRecord>,
}

/// Public view of a registered orchestrator
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorSummary {
    pub id: String,
    pub orchestrator_type: OrchestratorType,
    pub user: UserIdentity,
    pub parameters: serde_json::Value,
    pub scorers: Vec<String>,
    /// False once the pool has expired or evicted the instance
    pub pooled: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Result of a maintenance sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub orchestrators_expired: usize,
    pub handles_closed: usize,
}

#[derive(Default)]
struct Registry {
    configs: HashMap<Uuid, OrchestratorConfig>,
    ids_by_key: HashMap<String, Uuid>,
}

/// A run still in flight; removed as soon as it records its outcome
struct ActiveExecution {
    orchestrator_id: Uuid,
    path: PathBuf,
    cancel: CancelHandle,
    task: Option<JoinHandle<()>>,
}

/// Entry point for creating orchestrators and running them
pub struct OrchestratorService {
    config: CoreConfig,
    resolver: UserMemoryResolver,
    connections: Arc<ConnectionManager>,
    pool: OrchestratorPool,
    retry: RetryExecutor,
    tracker: ExecutionTracker,
    target: Arc<dyn PromptTarget>,
    registry: Mutex<Registry>,
    executions: Mutex<HashMap<String, ActiveExecution>>,
}

impl OrchestratorService {
    /// Validate `config`, open the store directory and wire the components.
    pub fn new(config: CoreConfig, target: Arc<dyn PromptTarget>) -> Result<Self> {
        config.validate()?;
        let resolver = UserMemoryResolver::open(
            &config.store.store_dir,
            config.store.salt.clone(),
            config.store.allow_salt_rotation,
        )?;
        let connections = Arc::new(ConnectionManager::new(config.store.busy_timeout()));
        let pool = OrchestratorPool::new(config.pool.clone(), Arc::clone(&connections));

        info!(
            store_dir = %config.store.store_dir.display(),
            target = target.name(),
            max_instances = config.pool.max_instances,
            ttl_secs = config.pool.ttl_secs,
            "Orchestrator service ready"
        );

        Ok(Self {
            retry: RetryExecutor::new(config.retry.clone()),
            config,
            resolver,
            connections,
            pool,
            tracker: ExecutionTracker::new(),
            target,
            registry: Mutex::new(Registry::default()),
            executions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Store path for a user
    pub fn store_path(&self, user: &UserIdentity) -> PathBuf {
        self.resolver.resolve(user)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Orchestrators
    // ─────────────────────────────────────────────────────────────────────────

    /// Register `config` and make sure a pooled instance exists for it.
    ///
    /// The same config always yields the same orchestrator id, including
    /// one registered before a restart.
    pub async fn create_orchestrator(&self, config: OrchestratorConfig) -> Result<String> {
        config.validate()?;
        let key = config.cache_key()?;
        let known = {
            let registry = self.registry.lock().map_err(|_| Error::LockPoisoned)?;
            registry.ids_by_key.get(&key).copied()
        };
        let candidate = match known {
            Some(id) => id,
            None => match self.persisted_id(&config, &key).await? {
                Some(id) => id,
                None => self.resolver.new_id(&config.user),
            },
        };

        let instance = self.instance_for(candidate, &config).await?;
        let id = instance.id();

        let mut registry = self.registry.lock().map_err(|_| Error::LockPoisoned)?;
        registry.ids_by_key.entry(key).or_insert(id);
        registry.configs.insert(id, config);
        Ok(id.to_string())
    }

    /// Registered orchestrator by id
    pub async fn get_orchestrator(&self, orchestrator_id: &str) -> Result<OrchestratorSummary> {
        let id = parse_orchestrator_id(orchestrator_id)?;
        let config = self.registered_config(id).await?;
        let live = self.pool.get(id)?;

        Ok(OrchestratorSummary {
            id: id.to_string(),
            orchestrator_type: config.orchestrator_type,
            user: config.user.clone(),
            parameters: serde_json::to_value(&config.parameters)?,
            scorers: live.as_ref().map(|i| i.scorer_names()).unwrap_or_default(),
            pooled: live.is_some(),
            created_at: live.as_ref().map(|i| i.created_at()),
            last_used_at: live.as_ref().map(|i| i.last_used_at()),
        })
    }

    /// Evict the orchestrator from the pool and forget its registration,
    /// persisted config included. Its recorded runs stay readable.
    ///
    /// Runs already in flight keep their own store reference and finish.
    pub async fn teardown_orchestrator(&self, orchestrator_id: &str) -> Result<bool> {
        let id = parse_orchestrator_id(orchestrator_id)?;
        let registered = {
            let mut registry = self.registry.lock().map_err(|_| Error::LockPoisoned)?;
            let config = registry.configs.remove(&id);
            registry.ids_by_key.retain(|_, v| *v != id);
            config.is_some()
        };
        let pooled = self.pool.remove(id)?;

        let raw = id.to_string();
        let mut persisted = false;
        for path in self.resolver.locate(id)? {
            persisted |= self
                .with_store(&path, |store| store.delete_orchestrator_config(&raw))
                .await?;
        }

        let removed = registered || pooled || persisted;
        if removed {
            info!(orchestrator_id = %id, "Tore down orchestrator");
        }
        Ok(removed)
    }

    /// Config for `id`, from the registry or else from the owner's store
    async fn registered_config(&self, id: Uuid) -> Result<OrchestratorConfig> {
        let cached = {
            let registry = self.registry.lock().map_err(|_| Error::LockPoisoned)?;
            registry.configs.get(&id).cloned()
        };
        if let Some(config) = cached {
            return Ok(config);
        }

        let raw = id.to_string();
        for path in self.resolver.locate(id)? {
            let stored = self
                .with_store(&path, |store| store.get_orchestrator_config(&raw))
                .await?;
            if let Some(stored) = stored {
                let config = OrchestratorConfig::from_stored(&stored)?;
                let mut registry = self.registry.lock().map_err(|_| Error::LockPoisoned)?;
                registry.ids_by_key.entry(stored.config_key).or_insert(id);
                registry.configs.insert(id, config.clone());
                return Ok(config);
            }
        }
        Err(Error::not_found("Orchestrator", raw))
    }

    /// Id an earlier process registered for the same config, if any
    async fn persisted_id(&self, config: &OrchestratorConfig, key: &str) -> Result<Option<Uuid>> {
        let path = self.resolver.resolve(&config.user);
        if !path.exists() {
            return Ok(None);
        }
        let stored = self
            .with_store(&path, |store| store.find_orchestrator_by_key(key))
            .await?;
        Ok(stored.and_then(|s| Uuid::parse_str(&s.orchestrator_id).ok()))
    }

    /// Pooled instance for `config`, created under `id` on a miss
    async fn instance_for(
        &self,
        id: Uuid,
        config: &OrchestratorConfig,
    ) -> Result<Arc<OrchestratorInstance>> {
        let path = self.resolver.resolve(&config.user);
        let connections = Arc::clone(&self.connections);

        self.pool
            .get_or_create(config, |config| async move {
                let handle = connections.acquire(&path).await?;
                let built = persist_config(&handle, id, &config)
                    .and_then(|_| OrchestratorInstance::new(id, config, Arc::clone(&handle)));
                if built.is_err() {
                    connections.release(&handle);
                }
                built
            })
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Executions
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a new run and dispatch it. Returns the execution id at once.
    pub async fn execute(
        self: &Arc<Self>,
        orchestrator_id: &str,
        request: ExecuteRequest,
    ) -> Result<String> {
        let id = parse_orchestrator_id(orchestrator_id)?;
        if let Some(slice) = request.batch {
            if slice.total == 0 || slice.index >= slice.total {
                return Err(Error::InvalidRequest(format!(
                    "batch index {} out of range for {} batches",
                    slice.index, slice.total
                )));
            }
        }

        let config = self.registered_config(id).await?;
        let instance = self.instance_for(id, &config).await?;
        let path = self.resolver.resolve(&config.user);

        // The run holds its own reference so pool eviction cannot close the
        // store underneath it.
        let store = self.connections.acquire(&path).await?;

        let execution_id = self.resolver.new_id(&config.user).to_string();
        let total_prompts = request.prompts.len() as u32;
        let batches = instance.plan_batches(request.prompts, request.batch);

        let (batch_index, total_batches, expected_span) = match request.batch {
            Some(slice) => (
                Some(slice.index),
                Some(slice.total),
                Some(BatchSpan::single(slice.index)),
            ),
            None => match batches.first().and_then(|(b, _)| *b) {
                Some(first) => (None, Some(first.total), Some(BatchSpan::whole(first.total))),
                None => (None, None, None),
            },
        };

        let run = ExecutionRun {
            execution_id: execution_id.clone(),
            orchestrator_id: id.to_string(),
            user_id: config.user.to_string(),
            mode: request.mode,
            status: ExecutionStatus::Created,
            started_at: Utc::now(),
            completed_at: None,
            batch_index,
            total_batches,
            expected_span,
            dataset: instance.params().dataset.clone(),
            counts: ExecutionCounts {
                total_prompts,
                ..Default::default()
            },
            error: None,
        };
        if let Err(e) = store.insert_run(&run) {
            self.connections.release(&store);
            return Err(e);
        }

        let (cancel_handle, cancel_token) = cancel_pair();
        {
            let Ok(mut executions) = self.executions.lock() else {
                self.connections.release(&store);
                return Err(Error::LockPoisoned);
            };
            executions.insert(
                execution_id.clone(),
                ActiveExecution {
                    orchestrator_id: id,
                    path,
                    cancel: cancel_handle,
                    task: None,
                },
            );
        }

        info!(
            execution_id = %execution_id,
            orchestrator_id = %id,
            mode = %request.mode,
            prompts = total_prompts,
            batches = batches.len(),
            "Dispatching execution"
        );

        // Everything the run logs, retries included, carries both ids.
        let span = info_span!(
            "execution",
            execution_id = %execution_id,
            orchestrator_id = %id
        );
        let service = Arc::clone(self);
        let exec_id = execution_id.clone();
        let mode = request.mode;
        let task = tokio::spawn(
            async move {
                service
                    .drive(instance, store, exec_id, mode, batches, cancel_token)
                    .await;
            }
            .instrument(span),
        );

        if let Ok(mut executions) = self.executions.lock() {
            if let Some(entry) = executions.get_mut(&execution_id) {
                entry.task = Some(task);
            }
        }

        Ok(execution_id)
    }

    /// Body of a dispatched run
    async fn drive(
        self: Arc<Self>,
        instance: Arc<OrchestratorInstance>,
        store: Arc<MemoryStoreHandle>,
        execution_id: String,
        mode: ExecutionMode,
        batches: Vec<(Option<BatchSlice>, Vec<(String, String)>)>,
        cancel: CancelToken,
    ) {
        let orchestrator_id = instance.id();
        let outcome = self
            .drive_run(&instance, &store, &execution_id, mode, batches, cancel)
            .await;

        let (next, reason) = match outcome {
            Ok(None) => (ExecutionStatus::Completed, None),
            Ok(Some(reason)) => (ExecutionStatus::Failed, Some(reason)),
            Err(e) => {
                error!(
                    execution_id = %execution_id,
                    orchestrator_id = %orchestrator_id,
                    error = %e,
                    "Execution failed"
                );
                (ExecutionStatus::Failed, Some(e.to_string()))
            }
        };

        match store.transition_run(&execution_id, next, reason.as_deref()) {
            Ok(run) => info!(
                execution_id = %execution_id,
                orchestrator_id = %orchestrator_id,
                status = %run.status,
                succeeded = run.counts.succeeded,
                failed = run.counts.failed,
                retried = run.counts.retried,
                error = ?run.error,
                "Execution finished"
            ),
            Err(e) => error!(
                execution_id = %execution_id,
                orchestrator_id = %orchestrator_id,
                error = %e,
                "Could not record execution outcome"
            ),
        }

        self.tracker.forget(&execution_id);
        self.connections.release(&store);
        if let Ok(mut executions) = self.executions.lock() {
            executions.remove(&execution_id);
        }
    }

    /// Run to the end. `Ok(Some(reason))` means the run ended early without
    /// an execution-level fault.
    async fn drive_run(
        &self,
        instance: &OrchestratorInstance,
        store: &MemoryStoreHandle,
        execution_id: &str,
        mode: ExecutionMode,
        batches: Vec<(Option<BatchSlice>, Vec<(String, String)>)>,
        cancel: CancelToken,
    ) -> Result<Option<String>> {
        store.transition_run(execution_id, ExecutionStatus::Running, None)?;

        let ctx = RunContext {
            execution_id,
            mode,
            store,
            target: self.target.as_ref(),
            retry: &self.retry,
            tracker: &self.tracker,
            cancel,
            default_concurrency: self.config.execution.default_concurrency,
            text_prefix_len: self.config.execution.text_prefix_len,
        };

        let run_timeout = self.config.execution.run_timeout();
        let summary = match tokio::time::timeout(run_timeout, instance.run(ctx, batches)).await {
            Ok(summary) => summary?,
            Err(_) => {
                warn!(
                    execution_id = %execution_id,
                    orchestrator_id = %instance.id(),
                    timeout_secs = run_timeout.as_secs(),
                    "Execution timed out"
                );
                return Ok(Some("timed out".to_string()));
            }
        };

        if summary.cancelled {
            info!(
                execution_id = %execution_id,
                orchestrator_id = %instance.id(),
                delivered = summary.delivered,
                skipped = summary.skipped,
                "Execution cancelled"
            );
            return Ok(Some("cancelled".to_string()));
        }

        // Completion of a batch run is what the recorded batches say it is.
        let run = store
            .get_run(execution_id)?
            .ok_or_else(|| Error::not_found("ExecutionRun", execution_id))?;
        if run.has_batch_metadata() && !self.tracker.is_run_complete(store, &run)? {
            return Ok(Some(
                "incomplete: not every expected batch was recorded".to_string(),
            ));
        }
        Ok(None)
    }

    /// Status, completion and scores of an execution
    pub async fn get_execution_status(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionStatusReport> {
        let path = self.execution_path(execution_id).await?;
        self.with_store(&path, |store| {
            let run = store
                .get_run(execution_id)?
                .ok_or_else(|| Error::not_found("ExecutionRun", execution_id))?;
            let is_complete = self.tracker.is_run_complete(store, &run)?;
            let completion_rate = self
                .tracker
                .completion_rate(store, std::slice::from_ref(&run))?;
            let batches_recorded = if run.has_batch_metadata() {
                store.batch_rows(execution_id)?.len()
            } else {
                0
            };
            let scores = store.list_scores(execution_id)?;

            Ok(ExecutionStatusReport {
                execution_id: run.execution_id,
                orchestrator_id: run.orchestrator_id,
                status: run.status,
                completion_rate,
                is_complete,
                counts: run.counts,
                batches_recorded,
                expected_batches: run.expected_span.map(|s| s.len),
                error: run.error,
                started_at: run.started_at,
                completed_at: run.completed_at,
                scores,
            })
        })
        .await
    }

    /// Owner of an execution, as recorded with the run
    pub async fn execution_owner(&self, execution_id: &str) -> Result<UserIdentity> {
        let path = self.execution_path(execution_id).await?;
        let run = self
            .with_store(&path, |store| {
                store
                    .get_run(execution_id)?
                    .ok_or_else(|| Error::not_found("ExecutionRun", execution_id))
            })
            .await?;
        UserIdentity::parse(&run.user_id)
    }

    /// A user's runs, newest first
    pub async fn list_executions(
        &self,
        user: &UserIdentity,
        filters: &ExecutionFilters,
    ) -> Result<Vec<ExecutionRun>> {
        let path = self.resolver.resolve(user);
        if !path.exists() {
            return Ok(Vec::new());
        }
        self.with_store(&path, |store| store.list_runs(filters)).await
    }

    /// Completion rate over a user's runs matching `filters`
    pub async fn completion_rate(
        &self,
        user: &UserIdentity,
        filters: &ExecutionFilters,
    ) -> Result<f64> {
        let path = self.resolver.resolve(user);
        if !path.exists() {
            return Ok(1.0);
        }
        self.with_store(&path, |store| {
            let runs = store.list_runs(filters)?;
            self.tracker.completion_rate(store, &runs)
        })
        .await
    }

    /// Ask a run to stop. Returns false if it had already finished.
    pub async fn cancel(&self, execution_id: &str) -> Result<bool> {
        let requested = {
            let executions = self.executions.lock().map_err(|_| Error::LockPoisoned)?;
            executions.get(execution_id).map(|entry| {
                entry.cancel.cancel();
                entry.orchestrator_id
            })
        };
        if let Some(orchestrator_id) = requested {
            info!(
                execution_id = %execution_id,
                orchestrator_id = %orchestrator_id,
                "Cancellation requested"
            );
            return Ok(true);
        }

        // Not in flight here: either finished or unknown.
        self.execution_path(execution_id).await?;
        Ok(false)
    }

    /// Wait for a dispatched run to finish and return its final record
    pub async fn wait_for_execution(&self, execution_id: &str) -> Result<ExecutionRun> {
        let in_flight = {
            let mut executions = self.executions.lock().map_err(|_| Error::LockPoisoned)?;
            executions
                .get_mut(execution_id)
                .map(|entry| (entry.orchestrator_id, entry.task.take()))
        };

        if let Some((orchestrator_id, Some(task))) = in_flight {
            if let Err(e) = task.await {
                error!(
                    execution_id = %execution_id,
                    orchestrator_id = %orchestrator_id,
                    error = %e,
                    "Execution task panicked"
                );
            }
        }

        let path = self.execution_path(execution_id).await?;

        self.with_store(&path, |store| {
            store
                .get_run(execution_id)?
                .ok_or_else(|| Error::not_found("ExecutionRun", execution_id))
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Expire pooled orchestrators, then close store handles left idle.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let orchestrators_expired = self.pool.clear_expired()?;
        let handles_closed = self.connections.close_idle(self.config.store.max_idle()).await?;
        if orchestrators_expired > 0 || handles_closed > 0 {
            info!(orchestrators_expired, handles_closed, "Sweep finished");
        }
        Ok(SweepReport {
            orchestrators_expired,
            handles_closed,
        })
    }

    /// Cancel every run, give them a moment to record, then close everything.
    pub async fn shutdown(&self) -> Result<()> {
        let tasks: Vec<JoinHandle<()>> = {
            let mut executions = self.executions.lock().map_err(|_| Error::LockPoisoned)?;
            executions
                .values_mut()
                .filter_map(|e| {
                    e.cancel.cancel();
                    e.task.take()
                })
                .collect()
        };

        if !tasks.is_empty() {
            info!(running = tasks.len(), "Waiting for executions to stop");
            let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
            if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(tasks))
                .await
                .is_err()
            {
                warn!("Executions did not stop in time, aborting");
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        let pooled = self.pool.clear()?;
        let closed = self.connections.close_all().await?;
        info!(pooled, closed, "Orchestrator service stopped");
        Ok(())
    }

    /// Store holding `execution_id`: the in-flight table first, then the
    /// stores matching the id's key prefix.
    async fn execution_path(&self, execution_id: &str) -> Result<PathBuf> {
        let in_flight = {
            let executions = self.executions.lock().map_err(|_| Error::LockPoisoned)?;
            executions.get(execution_id).map(|e| e.path.clone())
        };
        if let Some(path) = in_flight {
            return Ok(path);
        }

        let not_found = || Error::not_found("ExecutionRun", execution_id);
        let id = Uuid::parse_str(execution_id).map_err(|_| not_found())?;
        for path in self.resolver.locate(id)? {
            let recorded = self
                .with_store(&path, |store| Ok(store.get_run(execution_id)?.is_some()))
                .await?;
            if recorded {
                return Ok(path);
            }
        }
        Err(not_found())
    }

    async fn with_store<T>(
        &self,
        path: &Path,
        f: impl FnOnce(&MemoryStoreHandle) -> Result<T>,
    ) -> Result<T> {
        let store = self.connections.acquire(path).await?;
        let result = f(&store);
        self.connections.release(&store);
        result
    }
}

fn parse_orchestrator_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| Error::not_found("Orchestrator", raw))
}

fn persist_config(
    handle: &MemoryStoreHandle,
    id: Uuid,
    config: &OrchestratorConfig,
) -> Result<()> {
    handle.save_orchestrator_config(&StoredOrchestratorConfig {
        orchestrator_id: id.to_string(),
        config_key: config.cache_key()?,
        orchestrator_type: config.orchestrator_type.as_str().to_string(),
        parameters_json: serde_json::to_string(&config.parameters)?,
        user_id: config.user.to_string(),
        created_at: Utc::now().timestamp_millis(),
    })
}
