//! Orchestrators - configured execution engines.
//!
//! An [`OrchestratorConfig`] is an immutable value; its canonical JSON form
//! (type, user, parameters in key order) is the pool's cache key. An
//! [`OrchestratorInstance`] is the runtime object built from it and drives a
//! run's prompts through the retry executor, the scorers and the tracker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::identity::UserIdentity;
use crate::retry::{FailureKind, RetryExecutor};
use crate::scoring::{Scorer, ScorerSpec, ScoringInput, build_scorers, validate_specs};
use crate::store::{MemoryStoreHandle, PromptResultRow, StoredOrchestratorConfig};
use crate::target::{PromptRequest, PromptTarget};
use crate::tracker::ExecutionTracker;
use crate::types::{BatchSlice, ExecutionMode, ScoreRecord};

/// Upper bound on concurrent deliveries within one run
pub const MAX_CONCURRENCY: usize = 32;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Supported execution strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorType {
    /// Every prompt delivered once; no batch metadata unless a slice is given
    PromptSend,
    /// Prompts split into `batch_size` chunks, one batch recorded per chunk
    BatchPromptSend,
}

impl OrchestratorType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "prompt_send" => Some(Self::PromptSend),
            "batch_prompt_send" => Some(Self::BatchPromptSend),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PromptSend => "prompt_send",
            Self::BatchPromptSend => "batch_prompt_send",
        }
    }
}

impl std::fmt::Display for OrchestratorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed view of an orchestrator's parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorParams {
    pub dataset: Option<String>,
    pub generator: Option<String>,
    #[serde(default)]
    pub scorers: Vec<ScorerSpec>,
    pub batch_size: Option<usize>,
    pub concurrency: Option<usize>,
    pub system_prompt: Option<String>,
}

/// Immutable orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(rename = "type")]
    pub orchestrator_type: OrchestratorType,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub user: UserIdentity,
}

impl OrchestratorConfig {
    pub fn new(orchestrator_type: OrchestratorType, user: UserIdentity) -> Self {
        Self {
            orchestrator_type,
            parameters: BTreeMap::new(),
            user,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Parse and check parameters. Failures are configuration errors and
    /// never reach the pool.
    pub fn validate(&self) -> Result<OrchestratorParams> {
        let value = serde_json::to_value(&self.parameters)?;
        let params: OrchestratorParams = serde_json::from_value(value)
            .map_err(|e| Error::invalid_orchestrator(e.to_string()))?;

        match (self.orchestrator_type, params.batch_size) {
            (OrchestratorType::BatchPromptSend, None) => {
                return Err(Error::invalid_orchestrator(
                    "batch_prompt_send requires batch_size",
                ));
            }
            (_, Some(0)) => {
                return Err(Error::invalid_orchestrator("batch_size must be at least 1"));
            }
            _ => {}
        }

        if let Some(c) = params.concurrency {
            if c == 0 || c > MAX_CONCURRENCY {
                return Err(Error::invalid_orchestrator(format!(
                    "concurrency must be between 1 and {MAX_CONCURRENCY}, got {c}"
                )));
            }
        }

        validate_specs(&params.scorers).map_err(Error::invalid_orchestrator)?;

        Ok(params)
    }

    /// Stable serialisation; equal configs produce byte-equal output
    pub fn canonical(&self) -> Result<String> {
        // Keys are sorted at every level: BTreeMap here, serde_json's Map below.
        let body = serde_json::to_string(&self.parameters)?;
        Ok(format!("{}\n{}\n{}", self.orchestrator_type, self.user, body))
    }

    /// Pool cache key: hex SHA-256 of the canonical form
    pub fn cache_key(&self) -> Result<String> {
        Ok(hex::encode(Sha256::digest(self.canonical()?.as_bytes())))
    }

    /// Rebuild a config from its persisted row
    pub fn from_stored(stored: &StoredOrchestratorConfig) -> Result<Self> {
        let orchestrator_type = OrchestratorType::from_str(&stored.orchestrator_type)
            .ok_or_else(|| {
                Error::invalid_orchestrator(format!("unknown type {}", stored.orchestrator_type))
            })?;
        Ok(Self {
            orchestrator_type,
            parameters: serde_json::from_str(&stored.parameters_json)?,
            user: UserIdentity::parse(&stored.user_id)?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Instances
// ─────────────────────────────────────────────────────────────────────────────

/// A prompt to deliver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    Text(String),
    Keyed { id: String, text: String },
}

impl PromptInput {
    fn into_parts(self, position: usize) -> (String, String) {
        match self {
            Self::Text(text) => (format!("prompt-{position}"), text),
            Self::Keyed { id, text } => (id, text),
        }
    }
}

impl From<&str> for PromptInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Everything a run needs beyond the instance itself
pub struct RunContext<'a> {
    pub execution_id: &'a str,
    pub mode: ExecutionMode,
    pub store: &'a MemoryStoreHandle,
    pub target: &'a dyn PromptTarget,
    pub retry: &'a RetryExecutor,
    pub tracker: &'a ExecutionTracker,
    pub cancel: CancelToken,
    pub default_concurrency: usize,
    pub text_prefix_len: usize,
}

/// What a run did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub delivered: usize,
    pub skipped: usize,
    pub batches_recorded: usize,
    pub scores_recorded: usize,
    pub cancelled: bool,
}

/// Runtime orchestrator built from a config
pub struct OrchestratorInstance {
    id: Uuid,
    config: OrchestratorConfig,
    params: OrchestratorParams,
    memory_handle: Arc<MemoryStoreHandle>,
    created_at: DateTime<Utc>,
    created: Instant,
    last_used_at: AtomicI64,
    scorers: Vec<Arc<dyn Scorer>>,
}

impl std::fmt::Debug for OrchestratorInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorInstance")
            .field("id", &self.id)
            .field("type", &self.config.orchestrator_type)
            .field("user", &self.config.user)
            .field("store", &self.memory_handle.path())
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl OrchestratorInstance {
    /// Build an instance around an already acquired store handle.
    ///
    /// The handle reference is owned by the pool from here on.
    pub fn new(
        id: Uuid,
        config: OrchestratorConfig,
        memory_handle: Arc<MemoryStoreHandle>,
    ) -> Result<Self> {
        let params = config.validate()?;
        let scorers = build_scorers(&params.scorers);
        let now = Utc::now();
        Ok(Self {
            id,
            config,
            params,
            memory_handle,
            created_at: now,
            created: Instant::now(),
            last_used_at: AtomicI64::new(now.timestamp_millis()),
            scorers,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn params(&self) -> &OrchestratorParams {
        &self.params
    }

    pub fn memory_handle(&self) -> &Arc<MemoryStoreHandle> {
        &self.memory_handle
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        let millis = self.last_used_at.load(Ordering::Relaxed);
        DateTime::from_timestamp_millis(millis).unwrap_or(self.created_at)
    }

    /// Time since creation on the monotonic clock
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub(crate) fn touch(&self) {
        self.last_used_at
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn scorer_names(&self) -> Vec<String> {
        self.scorers.iter().map(|s| s.name().to_string()).collect()
    }

    fn concurrency(&self, default: usize) -> usize {
        self.params
            .concurrency
            .unwrap_or(default)
            .clamp(1, MAX_CONCURRENCY)
    }

    /// Split prompts into the batches this run records.
    ///
    /// Each entry carries the batch marker to attach (`(index, total)`), if any.
    pub fn plan_batches(
        &self,
        prompts: Vec<PromptInput>,
        slice: Option<BatchSlice>,
    ) -> Vec<(Option<BatchSlice>, Vec<(String, String)>)> {
        let prompts: Vec<(String, String)> = prompts
            .into_iter()
            .enumerate()
            .map(|(i, p)| p.into_parts(i))
            .collect();

        if let Some(slice) = slice {
            return vec![(Some(slice), prompts)];
        }

        match (self.config.orchestrator_type, self.params.batch_size) {
            (OrchestratorType::BatchPromptSend, Some(size)) if size > 0 => {
                let total = prompts.len().div_ceil(size).max(1) as u32;
                if prompts.is_empty() {
                    return vec![(Some(BatchSlice { index: 0, total }), Vec::new())];
                }
                prompts
                    .chunks(size)
                    .enumerate()
                    .map(|(index, chunk)| {
                        (
                            Some(BatchSlice {
                                index: index as u32,
                                total,
                            }),
                            chunk.to_vec(),
                        )
                    })
                    .collect()
            }
            _ => vec![(None, prompts)],
        }
    }

    /// Drive a planned run to the end, or until cancelled.
    ///
    /// Per-prompt failures are recorded as results; only store failures are
    /// returned as errors.
    pub async fn run(
        &self,
        ctx: RunContext<'_>,
        batches: Vec<(Option<BatchSlice>, Vec<(String, String)>)>,
    ) -> Result<RunSummary> {
        self.touch();
        let policy = ctx.retry.policy(ctx.mode);
        let inter_item = policy.inter_item_delay();
        let concurrency = self.concurrency(ctx.default_concurrency);
        let mut summary = RunSummary::default();

        info!(
            execution_id = %ctx.execution_id,
            orchestrator_id = %self.id,
            mode = %ctx.mode,
            batches = batches.len(),
            concurrency,
            "Starting run"
        );

        for (batch, prompts) in batches {
            if ctx.cancel.is_cancelled() {
                summary.skipped += prompts.len();
                continue;
            }

            let planned = prompts.len();
            let mut first = true;
            let cancel = ctx.cancel.clone();
            let ctx_ref = &ctx;

            let mut deliveries = std::pin::pin!(stream::iter(prompts)
                .then(|prompt| {
                    let mut cancel = cancel.clone();
                    let delay = if std::mem::take(&mut first) {
                        Duration::ZERO
                    } else {
                        inter_item
                    };
                    async move {
                        if !delay.is_zero() {
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = cancel.cancelled() => {}
                            }
                        }
                        prompt
                    }
                })
                .take_while(|_| {
                    let go = !cancel.is_cancelled();
                    async move { go }
                })
                .map(|(prompt_id, text)| self.deliver(ctx_ref, batch, prompt_id, text))
                .buffer_unordered(concurrency));

            let mut scores: Vec<ScoreRecord> = Vec::new();
            let mut delivered = 0;
            while let Some(outcome) = deliveries.next().await {
                scores.extend(outcome?);
                delivered += 1;
            }

            summary.delivered += delivered;
            summary.skipped += planned - delivered;

            if delivered < planned {
                // A partial batch must not be recorded as if it were whole.
                warn!(
                    execution_id = %ctx.execution_id,
                    orchestrator_id = %self.id,
                    batch_index = ?batch.map(|b| b.index),
                    delivered,
                    planned,
                    "Batch interrupted by cancellation"
                );
                if !scores.is_empty() {
                    summary.scores_recorded +=
                        ctx.tracker.record_scores(ctx.store, ctx.execution_id, &scores)?;
                }
                continue;
            }

            summary.scores_recorded +=
                ctx.tracker.record_batch(ctx.store, ctx.execution_id, batch, scores)?;
            if batch.is_some() {
                summary.batches_recorded += 1;
            }
        }

        summary.cancelled = ctx.cancel.is_cancelled();
        self.touch();
        Ok(summary)
    }

    /// Deliver one prompt, record its terminal outcome and score it.
    async fn deliver(
        &self,
        ctx: &RunContext<'_>,
        batch: Option<BatchSlice>,
        prompt_id: String,
        text: String,
    ) -> Result<Vec<ScoreRecord>> {
        let request = PromptRequest {
            prompt_id,
            prompt: text,
            generator: self.params.generator.clone(),
            system_prompt: self.params.system_prompt.clone(),
        };
        let target = ctx.target;
        let outcome = ctx
            .retry
            .send_cancellable(ctx.mode, ctx.cancel.clone(), || target.send(&request))
            .await;

        let response = match outcome {
            Ok(done) => {
                ctx.store.record_prompt_result(&PromptResultRow {
                    execution_id: ctx.execution_id.to_string(),
                    prompt_id: request.prompt_id.clone(),
                    batch_index: batch.map(|b| b.index),
                    succeeded: true,
                    attempts: done.attempts,
                    response_text: Some(done.value.text.clone()),
                    error: None,
                })?;
                done.value
            }
            Err(failure) => {
                let cancelled = failure.kind == FailureKind::Cancelled;
                debug!(
                    execution_id = %ctx.execution_id,
                    orchestrator_id = %self.id,
                    prompt_id = %request.prompt_id,
                    cancelled = cancelled,
                    error = %failure,
                    "Prompt ended without a response"
                );
                ctx.store.record_prompt_result(&PromptResultRow {
                    execution_id: ctx.execution_id.to_string(),
                    prompt_id: request.prompt_id.clone(),
                    batch_index: batch.map(|b| b.index),
                    succeeded: false,
                    attempts: failure.attempts,
                    response_text: None,
                    error: Some(failure.to_string()),
                })?;
                return Ok(Vec::new());
            }
        };

        let input = ScoringInput {
            execution_id: ctx.execution_id,
            prompt_id: &request.prompt_id,
            prompt: &request.prompt,
            response: &response.text,
            received_at: response.received_at,
        };

        let mut records = Vec::new();
        for scorer in &self.scorers {
            match scorer.score(&input).await {
                Ok(drafts) => records.extend(
                    drafts
                        .into_iter()
                        .map(|d| d.into_record(&input, scorer.name(), ctx.text_prefix_len)),
                ),
                Err(e) => {
                    warn!(
                        execution_id = %ctx.execution_id,
                        orchestrator_id = %self.id,
                        prompt_id = %request.prompt_id,
                        scorer = scorer.name(),
                        error = %e,
                        "Scorer failed"
                    );
                    ctx.store
                        .append_prompt_error(ctx.execution_id, &request.prompt_id, &e.to_string())?;
                }
            }
        }
        Ok(records)
    }
}
