//! Shared types for executions, batches and scores.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Execution mode selecting the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Interactive run, fast feedback
    Test,
    /// Bulk run, eventual success
    Full,
}

impl ExecutionMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "test" => Some(Self::Test),
            "full" => Some(Self::Full),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::Full => "full",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of an execution run: `created -> running -> {completed, failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// A run fails from any non-terminal state; it only completes from running.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Running)
                | (Self::Created, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A caller-declared slice of a larger dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSlice {
    pub index: u32,
    pub total: u32,
}

/// The contiguous range of batch indices a run expects to record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSpan {
    pub start: u32,
    pub len: u32,
}

impl BatchSpan {
    /// Span of a run that processes every batch of its own dataset
    pub fn whole(total_batches: u32) -> Self {
        Self {
            start: 0,
            len: total_batches,
        }
    }

    /// Span of a run that processes exactly one slice
    pub fn single(index: u32) -> Self {
        Self { start: index, len: 1 }
    }

    pub fn end(&self) -> u32 {
        self.start + self.len
    }

    /// True when `observed` is exactly the indices `start..end`.
    pub fn is_covered_by(&self, observed: &BTreeSet<u32>) -> bool {
        self.len > 0
            && observed.len() == self.len as usize
            && observed.iter().copied().eq(self.start..self.end())
    }
}

/// One invocation of an orchestrator against a set of prompts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub execution_id: String,
    pub orchestrator_id: String,
    pub user_id: String,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub batch_index: Option<u32>,
    pub total_batches: Option<u32>,
    /// Stored with the run so completion never depends on a sibling run
    pub expected_span: Option<BatchSpan>,
    pub dataset: Option<String>,
    pub counts: ExecutionCounts,
    pub error: Option<String>,
}

impl ExecutionRun {
    pub fn has_batch_metadata(&self) -> bool {
        self.expected_span.is_some()
    }
}

/// Aggregate per-prompt outcome counts for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCounts {
    pub total_prompts: u32,
    pub succeeded: u32,
    pub failed: u32,
    /// Retries spent across all deliveries
    pub retried: u32,
}

impl ExecutionCounts {
    pub fn terminal(&self) -> u32 {
        self.succeeded + self.failed
    }
}

/// Kind of verdict a scorer produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreType {
    Boolean,
    Scale,
    String,
}

impl ScoreType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "boolean" => Some(Self::Boolean),
            "scale" => Some(Self::Scale),
            "string" => Some(Self::String),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Scale => "scale",
            Self::String => "string",
        }
    }
}

impl std::fmt::Display for ScoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One scorer's verdict on one prompt/response pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    /// Content-derived; see [`ScoreRecord::derive_id`]
    pub score_id: String,
    pub execution_id: String,
    pub prompt_id: String,
    pub value: String,
    pub score_type: ScoreType,
    pub category: String,
    pub rationale: Option<String>,
    pub scorer: String,
    pub text_prefix: String,
    pub timestamp: DateTime<Utc>,
    pub batch_index: Option<u32>,
}

impl ScoreRecord {
    /// Build a record, deriving its id from its content.
    ///
    /// The timestamp is truncated to milliseconds so that a record read back
    /// from the store derives the same id.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        execution_id: impl Into<String>,
        prompt_id: impl Into<String>,
        value: impl Into<String>,
        score_type: ScoreType,
        category: impl Into<String>,
        rationale: Option<String>,
        scorer: impl Into<String>,
        text_prefix: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let prompt_id = prompt_id.into();
        let value = value.into();
        let category = category.into();
        let text_prefix = text_prefix.into();
        let timestamp = truncate_millis(timestamp);
        let score_id = Self::derive_id(&value, timestamp, &text_prefix, &prompt_id, &category);

        Self {
            score_id,
            execution_id: execution_id.into(),
            prompt_id,
            value,
            score_type,
            category,
            rationale,
            scorer: scorer.into(),
            text_prefix,
            timestamp,
            batch_index: None,
        }
    }

    /// De-duplication key over `(value, timestamp, text_prefix, prompt_id, category)`.
    pub fn derive_id(
        value: &str,
        timestamp: DateTime<Utc>,
        text_prefix: &str,
        prompt_id: &str,
        category: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        for part in [
            value,
            &timestamp.timestamp_millis().to_string(),
            text_prefix,
            prompt_id,
            category,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Drop sub-millisecond precision
pub fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

/// First `len` characters of `text`, on a char boundary
pub fn text_prefix(text: &str, len: usize) -> String {
    text.chars().take(len).collect()
}
