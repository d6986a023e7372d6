//! Row-level operations on a user's store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use super::MemoryStoreHandle;
use crate::error::{Error, Result};
use crate::types::{
    BatchSpan, ExecutionCounts, ExecutionMode, ExecutionRun, ExecutionStatus, ScoreRecord,
    ScoreType,
};

/// Orchestrator configuration as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOrchestratorConfig {
    pub orchestrator_id: String,
    pub config_key: String,
    pub orchestrator_type: String,
    pub parameters_json: String,
    pub user_id: String,
    pub created_at: i64,
}

/// Terminal outcome of one prompt delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptResultRow {
    pub execution_id: String,
    pub prompt_id: String,
    pub batch_index: Option<u32>,
    pub succeeded: bool,
    pub attempts: u32,
    pub response_text: Option<String>,
    pub error: Option<String>,
}

/// Filters for listing execution runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilters {
    pub orchestrator_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub mode: Option<ExecutionMode>,
    pub limit: Option<usize>,
}

const RUN_COLUMNS: &str = "execution_id, orchestrator_id, user_id, mode, status, started_at,
     completed_at, batch_index, total_batches, span_start, span_len, dataset,
     total_prompts, succeeded, failed, retried, error";

const CONFIG_COLUMNS: &str =
    "orchestrator_id, config_key, orchestrator_type, parameters_json, user_id, created_at";

const SCORE_COLUMNS: &str = "score_id, execution_id, prompt_id, value, score_type, category,
     rationale, scorer, text_prefix, timestamp, batch_index";

impl MemoryStoreHandle {
    // ─────────────────────────────────────────────────────────────────────────
    // Orchestrator configs
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist an orchestrator configuration
    pub fn save_orchestrator_config(&self, config: &StoredOrchestratorConfig) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO orchestrator_configs
                 (orchestrator_id, config_key, orchestrator_type, parameters_json, user_id,
                  created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    config.orchestrator_id,
                    config.config_key,
                    config.orchestrator_type,
                    config.parameters_json,
                    config.user_id,
                    config.created_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Get an orchestrator configuration by ID
    pub fn get_orchestrator_config(
        &self,
        orchestrator_id: &str,
    ) -> Result<Option<StoredOrchestratorConfig>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONFIG_COLUMNS} FROM orchestrator_configs WHERE orchestrator_id = ?1"
            );
            let config = conn
                .query_row(&sql, params![orchestrator_id], map_config)
                .optional()?;
            Ok(config)
        })
    }

    /// Earliest orchestrator registered under a config key
    pub fn find_orchestrator_by_key(
        &self,
        config_key: &str,
    ) -> Result<Option<StoredOrchestratorConfig>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONFIG_COLUMNS} FROM orchestrator_configs WHERE config_key = ?1
                 ORDER BY created_at, orchestrator_id LIMIT 1"
            );
            let config = conn
                .query_row(&sql, params![config_key], map_config)
                .optional()?;
            Ok(config)
        })
    }

    /// Forget an orchestrator configuration. Runs recorded against it stay.
    pub fn delete_orchestrator_config(&self, orchestrator_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM orchestrator_configs WHERE orchestrator_id = ?1",
                params![orchestrator_id],
            )?;
            Ok(deleted > 0)
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution runs
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a new execution run
    pub fn insert_run(&self, run: &ExecutionRun) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO execution_runs
                 (execution_id, orchestrator_id, user_id, mode, status, started_at, completed_at,
                  batch_index, total_batches, span_start, span_len, dataset,
                  total_prompts, succeeded, failed, retried, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                         ?16, ?17)",
                params![
                    run.execution_id,
                    run.orchestrator_id,
                    run.user_id,
                    run.mode.as_str(),
                    run.status.as_str(),
                    run.started_at.timestamp_millis(),
                    run.completed_at.map(|t| t.timestamp_millis()),
                    run.batch_index,
                    run.total_batches,
                    run.expected_span.map(|s| s.start),
                    run.expected_span.map(|s| s.len),
                    run.dataset,
                    run.counts.total_prompts,
                    run.counts.succeeded,
                    run.counts.failed,
                    run.counts.retried,
                    run.error,
                ],
            )?;
            Ok(())
        })
    }

    /// Get an execution run by ID
    pub fn get_run(&self, execution_id: &str) -> Result<Option<ExecutionRun>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {RUN_COLUMNS} FROM execution_runs WHERE execution_id = ?1");
            let run = conn
                .query_row(&sql, params![execution_id], map_run)
                .optional()?;
            Ok(run)
        })
    }

    /// List execution runs, newest first
    pub fn list_runs(&self, filters: &ExecutionFilters) -> Result<Vec<ExecutionRun>> {
        self.with_conn(|conn| {
            let mut sql = format!("SELECT {RUN_COLUMNS} FROM execution_runs WHERE 1=1");
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(ref orchestrator_id) = filters.orchestrator_id {
                sql.push_str(" AND orchestrator_id = ?");
                params_vec.push(Box::new(orchestrator_id.clone()));
            }

            if let Some(status) = filters.status {
                sql.push_str(" AND status = ?");
                params_vec.push(Box::new(status.as_str()));
            }

            if let Some(mode) = filters.mode {
                sql.push_str(" AND mode = ?");
                params_vec.push(Box::new(mode.as_str()));
            }

            sql.push_str(" ORDER BY started_at DESC, execution_id");

            if let Some(limit) = filters.limit {
                sql.push_str(&format!(" LIMIT {}", limit));
            }

            let param_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let runs = stmt
                .query_map(param_refs.as_slice(), map_run)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(runs)
        })
    }

    /// Move a run to `next`, enforcing the run state machine.
    pub fn transition_run(
        &self,
        execution_id: &str,
        next: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<ExecutionRun> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let current: String = tx
                .query_row(
                    "SELECT status FROM execution_runs WHERE execution_id = ?1",
                    params![execution_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| Error::not_found("ExecutionRun", execution_id))?;
            let current = ExecutionStatus::from_str(&current)
                .ok_or_else(|| Error::Other(format!("invalid stored status: {current}")))?;

            if !current.can_transition_to(next) {
                return Err(Error::InvalidTransition {
                    from: current.to_string(),
                    to: next.to_string(),
                });
            }

            let completed_at = next.is_terminal().then(|| Utc::now().timestamp_millis());
            tx.execute(
                "UPDATE execution_runs
                 SET status = ?1, completed_at = COALESCE(?2, completed_at),
                     error = COALESCE(?3, error)
                 WHERE execution_id = ?4",
                params![next.as_str(), completed_at, error, execution_id],
            )?;

            let sql = format!("SELECT {RUN_COLUMNS} FROM execution_runs WHERE execution_id = ?1");
            let run = tx.query_row(&sql, params![execution_id], map_run)?;
            tx.commit()?;
            Ok(run)
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Prompt results
    // ─────────────────────────────────────────────────────────────────────────

    /// Record the terminal outcome of a prompt and fold it into the run's
    /// counts. A second outcome for the same prompt is ignored.
    ///
    /// Returns true if the outcome was new.
    pub fn record_prompt_result(&self, result: &PromptResultRow) -> Result<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO prompt_results
                 (execution_id, prompt_id, batch_index, status, attempts, response_text, error,
                  recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    result.execution_id,
                    result.prompt_id,
                    result.batch_index,
                    if result.succeeded { "succeeded" } else { "failed" },
                    result.attempts,
                    result.response_text,
                    result.error,
                    Utc::now().timestamp_millis(),
                ],
            )?;

            if inserted > 0 {
                let (succeeded, failed) = if result.succeeded { (1, 0) } else { (0, 1) };
                tx.execute(
                    "UPDATE execution_runs
                     SET succeeded = succeeded + ?1, failed = failed + ?2, retried = retried + ?3
                     WHERE execution_id = ?4",
                    params![
                        succeeded,
                        failed,
                        result.attempts.saturating_sub(1),
                        result.execution_id
                    ],
                )?;
            }
            tx.commit()?;
            Ok(inserted > 0)
        })
    }

    /// Attach a scorer failure note to an already recorded prompt result
    pub fn append_prompt_error(
        &self,
        execution_id: &str,
        prompt_id: &str,
        note: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE prompt_results
                 SET error = CASE WHEN error IS NULL THEN ?1 ELSE error || '; ' || ?1 END
                 WHERE execution_id = ?2 AND prompt_id = ?3",
                params![note, execution_id, prompt_id],
            )?;
            Ok(())
        })
    }

    /// List prompt results for a run
    pub fn list_prompt_results(&self, execution_id: &str) -> Result<Vec<PromptResultRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT execution_id, prompt_id, batch_index, status, attempts, response_text,
                        error
                 FROM prompt_results WHERE execution_id = ?1 ORDER BY recorded_at, prompt_id",
            )?;
            let rows = stmt
                .query_map(params![execution_id], |row| {
                    Ok(PromptResultRow {
                        execution_id: row.get(0)?,
                        prompt_id: row.get(1)?,
                        batch_index: row.get(2)?,
                        succeeded: row.get::<_, String>(3)? == "succeeded",
                        attempts: row.get(4)?,
                        response_text: row.get(5)?,
                        error: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Batches and scores
    // ─────────────────────────────────────────────────────────────────────────

    /// Write a batch of scores and its batch marker in one transaction.
    ///
    /// Scores whose id is already stored for this run are skipped; the same
    /// id under another run is a different score. Returns the number of newly
    /// stored scores.
    pub fn commit_batch(
        &self,
        execution_id: &str,
        batch: Option<(u32, u32)>,
        scores: &[ScoreRecord],
    ) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO score_records
                     (score_id, execution_id, prompt_id, value, score_type, category,
                      rationale, scorer, text_prefix, timestamp, batch_index)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                )?;
                for score in scores {
                    inserted += stmt.execute(params![
                        score.score_id,
                        execution_id,
                        score.prompt_id,
                        score.value,
                        score.score_type.as_str(),
                        score.category,
                        score.rationale,
                        score.scorer,
                        score.text_prefix,
                        score.timestamp.timestamp_millis(),
                        batch.map(|(index, _)| index),
                    ])?;
                }
            }

            if let Some((index, total)) = batch {
                tx.execute(
                    "INSERT INTO execution_batches
                     (execution_id, batch_index, total_batches, score_count, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(execution_id, batch_index)
                     DO UPDATE SET score_count = score_count + excluded.score_count,
                                   total_batches = excluded.total_batches",
                    params![
                        execution_id,
                        index,
                        total,
                        inserted as i64,
                        Utc::now().timestamp_millis()
                    ],
                )?;
            }

            tx.commit()?;
            Ok(inserted)
        })
    }

    /// Batch index -> declared total for every batch recorded against a run
    pub fn batch_rows(&self, execution_id: &str) -> Result<BTreeMap<u32, u32>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT batch_index, total_batches FROM execution_batches WHERE execution_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![execution_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<BTreeMap<u32, u32>, _>>()?;
            Ok(rows)
        })
    }

    /// List scores for a run
    pub fn list_scores(&self, execution_id: &str) -> Result<Vec<ScoreRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {SCORE_COLUMNS} FROM score_records WHERE execution_id = ?1
                 ORDER BY timestamp, prompt_id, score_id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let scores = stmt
                .query_map(params![execution_id], map_score)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(scores)
        })
    }

    /// Number of stored scores for a run
    pub fn count_scores(&self, execution_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM score_records WHERE execution_id = ?1",
                params![execution_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }
}

fn invalid_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn map_config(row: &Row) -> rusqlite::Result<StoredOrchestratorConfig> {
    Ok(StoredOrchestratorConfig {
        orchestrator_id: row.get(0)?,
        config_key: row.get(1)?,
        orchestrator_type: row.get(2)?,
        parameters_json: row.get(3)?,
        user_id: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn map_run(row: &Row) -> rusqlite::Result<ExecutionRun> {
    let mode: String = row.get(3)?;
    let status: String = row.get(4)?;
    let span_start: Option<u32> = row.get(9)?;
    let span_len: Option<u32> = row.get(10)?;

    Ok(ExecutionRun {
        execution_id: row.get(0)?,
        orchestrator_id: row.get(1)?,
        user_id: row.get(2)?,
        mode: ExecutionMode::from_str(&mode)
            .ok_or_else(|| invalid_column(3, format!("invalid mode: {mode}")))?,
        status: ExecutionStatus::from_str(&status)
            .ok_or_else(|| invalid_column(4, format!("invalid status: {status}")))?,
        started_at: from_millis(row.get(5)?),
        completed_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
        batch_index: row.get(7)?,
        total_batches: row.get(8)?,
        expected_span: match (span_start, span_len) {
            (Some(start), Some(len)) => Some(BatchSpan { start, len }),
            _ => None,
        },
        dataset: row.get(11)?,
        counts: ExecutionCounts {
            total_prompts: row.get(12)?,
            succeeded: row.get(13)?,
            failed: row.get(14)?,
            retried: row.get(15)?,
        },
        error: row.get(16)?,
    })
}

fn map_score(row: &Row) -> rusqlite::Result<ScoreRecord> {
    let score_type: String = row.get(4)?;
    Ok(ScoreRecord {
        score_id: row.get(0)?,
        execution_id: row.get(1)?,
        prompt_id: row.get(2)?,
        value: row.get(3)?,
        score_type: ScoreType::from_str(&score_type)
            .ok_or_else(|| invalid_column(4, format!("invalid score type: {score_type}")))?,
        category: row.get(5)?,
        rationale: row.get(6)?,
        scorer: row.get(7)?,
        text_prefix: row.get(8)?,
        timestamp: from_millis(row.get(9)?),
        batch_index: row.get(10)?,
    })
}
