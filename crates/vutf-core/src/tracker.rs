//! ExecutionTracker - batch progress, score de-duplication and completion.
//!
//! Scores are keyed by their content-derived id. The tracker drops ids it has
//! already committed for a run before touching the store, and the store
//! ignores ids it already holds, so any number of collection paths that
//! observe the same verdict leave exactly one row behind.
//!
//! Completion is judged per run against the span that run declared for
//! itself. A run without batch metadata is self-contained.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Error, Result};
use crate::store::MemoryStoreHandle;
use crate::types::{BatchSlice, ExecutionRun, ExecutionStatus, ScoreRecord};

/// Records batches and answers completion questions
#[derive(Default)]
pub struct ExecutionTracker {
    /// execution_id -> score ids committed through this tracker
    committed: Mutex<HashMap<String, HashSet<String>>>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit `scores` and the batch marker for `batch` atomically.
    ///
    /// Duplicate scores are absorbed, never reported as errors. Returns the
    /// number of newly stored scores.
    pub fn record_batch(
        &self,
        store: &MemoryStoreHandle,
        execution_id: &str,
        batch: Option<BatchSlice>,
        scores: Vec<ScoreRecord>,
    ) -> Result<usize> {
        let fresh: Vec<ScoreRecord> = {
            let committed = self.committed.lock().map_err(|_| Error::LockPoisoned)?;
            let known = committed.get(execution_id);
            let mut batch_ids = HashSet::new();
            scores
                .into_iter()
                .filter(|s| !known.is_some_and(|k| k.contains(&s.score_id)))
                .filter(|s| batch_ids.insert(s.score_id.clone()))
                .map(|mut s| {
                    s.execution_id = execution_id.to_string();
                    s.batch_index = batch.map(|b| b.index);
                    s
                })
                .collect()
        };

        let inserted = store.commit_batch(execution_id, batch.map(|b| (b.index, b.total)), &fresh)?;

        let mut committed = self.committed.lock().map_err(|_| Error::LockPoisoned)?;
        committed
            .entry(execution_id.to_string())
            .or_default()
            .extend(fresh.into_iter().map(|s| s.score_id));

        debug!(
            execution_id = %execution_id,
            batch_index = ?batch.map(|b| b.index),
            total_batches = ?batch.map(|b| b.total),
            inserted,
            "Recorded batch"
        );
        Ok(inserted)
    }

    /// Commit scores that belong to no batch
    pub fn record_scores(
        &self,
        store: &MemoryStoreHandle,
        execution_id: &str,
        scores: &[ScoreRecord],
    ) -> Result<usize> {
        self.record_batch(store, execution_id, None, scores.to_vec())
    }

    /// Whether the stored run is complete
    pub fn is_complete(&self, store: &MemoryStoreHandle, execution_id: &str) -> Result<bool> {
        let run = store
            .get_run(execution_id)?
            .ok_or_else(|| Error::not_found("ExecutionRun", execution_id))?;
        self.is_run_complete(store, &run)
    }

    pub fn is_run_complete(&self, store: &MemoryStoreHandle, run: &ExecutionRun) -> Result<bool> {
        if !run.has_batch_metadata() {
            return Ok(run_is_complete(run, &BTreeSet::new()));
        }
        let observed: BTreeSet<u32> = store.batch_rows(&run.execution_id)?.into_keys().collect();
        Ok(run_is_complete(run, &observed))
    }

    /// Fraction of `runs` that are complete; `1.0` for an empty set
    pub fn completion_rate(&self, store: &MemoryStoreHandle, runs: &[ExecutionRun]) -> Result<f64> {
        if runs.is_empty() {
            return Ok(1.0);
        }
        let mut complete = 0usize;
        for run in runs {
            if self.is_run_complete(store, run)? {
                complete += 1;
            }
        }
        Ok(complete as f64 / runs.len() as f64)
    }

    /// Drop in-memory dedup state for a finished run. The store still
    /// rejects duplicates afterwards.
    pub fn forget(&self, execution_id: &str) {
        if let Ok(mut committed) = self.committed.lock() {
            committed.remove(execution_id);
        }
    }
}

/// Completion of one run given the batch indices observed for it
pub fn run_is_complete(run: &ExecutionRun, observed: &BTreeSet<u32>) -> bool {
    match run.expected_span {
        None => run.status == ExecutionStatus::Completed,
        Some(span) => span.is_covered_by(observed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BatchSpan, ExecutionCounts, ExecutionMode, ScoreType};
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> MemoryStoreHandle {
        MemoryStoreHandle::open(&tmp.path().join("memory_t.store"), Duration::ZERO).unwrap()
    }

    fn run(id: &str, span: Option<BatchSpan>) -> ExecutionRun {
        ExecutionRun {
            execution_id: id.into(),
            orchestrator_id: "orch-1".into(),
            user_id: "alice".into(),
            mode: ExecutionMode::Full,
            status: ExecutionStatus::Created,
            started_at: Utc::now(),
            completed_at: None,
            batch_index: None,
            total_batches: span.map(|s| s.len),
            expected_span: span,
            dataset: None,
            counts: ExecutionCounts::default(),
            error: None,
        }
    }

    fn score(prompt: &str) -> ScoreRecord {
        let ts = chrono::DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        ScoreRecord::new(
            "exec-1",
            prompt,
            "true",
            ScoreType::Boolean,
            "refusal",
            None,
            "refusal",
            "I cannot",
            ts,
        )
    }

    #[test]
    fn test_same_score_three_times_persists_once() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.insert_run(&run("exec-1", None)).unwrap();
        let tracker = ExecutionTracker::new();

        assert_eq!(tracker.record_batch(&store, "exec-1", None, vec![score("p1")]).unwrap(), 1);
        assert_eq!(tracker.record_batch(&store, "exec-1", None, vec![score("p1")]).unwrap(), 0);

        // A fresh tracker has no memory; the store still absorbs the duplicate.
        let other = ExecutionTracker::new();
        assert_eq!(other.record_batch(&store, "exec-1", None, vec![score("p1")]).unwrap(), 0);

        assert_eq!(store.count_scores("exec-1").unwrap(), 1);
    }

    #[test]
    fn test_duplicates_within_one_call_collapse() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        store.insert_run(&run("exec-1", None)).unwrap();
        let tracker = ExecutionTracker::new();

        let n = tracker
            .record_batch(&store, "exec-1", None, vec![score("p1"), score("p1"), score("p2")])
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_batch_free_run_complete_once_completed() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let tracker = ExecutionTracker::new();

        // An unrelated multi-batch run must not influence the batch-free one.
        store.insert_run(&run("multi", Some(BatchSpan::whole(57)))).unwrap();
        store.insert_run(&run("single", None)).unwrap();

        assert!(!tracker.is_complete(&store, "single").unwrap());
        store.transition_run("single", ExecutionStatus::Running, None).unwrap();
        store.transition_run("single", ExecutionStatus::Completed, None).unwrap();
        assert!(tracker.is_complete(&store, "single").unwrap());
        assert!(!tracker.is_complete(&store, "multi").unwrap());
    }

    #[test]
    fn test_multi_batch_needs_contiguous_span() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let tracker = ExecutionTracker::new();
        store.insert_run(&run("exec-1", Some(BatchSpan::whole(3)))).unwrap();

        let batch = |index| Some(BatchSlice { index, total: 3 });
        tracker.record_batch(&store, "exec-1", batch(0), vec![score("p1")]).unwrap();
        tracker.record_batch(&store, "exec-1", batch(2), vec![score("p3")]).unwrap();
        assert!(!tracker.is_complete(&store, "exec-1").unwrap());

        tracker.record_batch(&store, "exec-1", batch(1), vec![]).unwrap();
        assert!(tracker.is_complete(&store, "exec-1").unwrap());

        let scores = store.list_scores("exec-1").unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores.iter().all(|s| s.batch_index.is_some()));
    }

    #[test]
    fn test_slice_run_judged_by_its_own_span() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let tracker = ExecutionTracker::new();
        store.insert_run(&run("slice-4", Some(BatchSpan::single(4)))).unwrap();

        tracker
            .record_batch(&store, "slice-4", Some(BatchSlice { index: 4, total: 10 }), vec![])
            .unwrap();
        assert!(tracker.is_complete(&store, "slice-4").unwrap());
    }

    #[test]
    fn test_completion_rate() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp);
        let tracker = ExecutionTracker::new();
        assert_eq!(tracker.completion_rate(&store, &[]).unwrap(), 1.0);

        let mut done = run("a", None);
        done.status = ExecutionStatus::Completed;
        let pending = run("b", None);
        let rate = tracker.completion_rate(&store, &[done, pending]).unwrap();
        assert!((rate - 0.5).abs() < f64::EPSILON);
    }
}
