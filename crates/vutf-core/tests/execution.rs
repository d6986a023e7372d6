//! End-to-end runs through the OrchestratorService façade.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use vutf_core::config::ExecutionConfig;
use vutf_core::target::{ScriptedTarget, TargetError};
use vutf_core::{
    BatchSlice, CoreConfig, ExecuteRequest, ExecutionFilters, ExecutionMode, ExecutionStatus,
    OrchestratorConfig, OrchestratorService, OrchestratorType, UserIdentity,
};

fn alice() -> UserIdentity {
    UserIdentity::parse("alice").unwrap()
}

fn service(tmp: &TempDir, target: Arc<ScriptedTarget>) -> Arc<OrchestratorService> {
    let config = CoreConfig::new(tmp.path().join("stores"), "s");
    Arc::new(OrchestratorService::new(config, target).unwrap())
}

fn request(prompts: &[&str], mode: ExecutionMode) -> ExecuteRequest {
    ExecuteRequest {
        prompts: prompts.iter().map(|p| (*p).into()).collect(),
        mode,
        batch: None,
    }
}

#[tokio::test(start_paused = true)]
async fn alice_full_run_survives_one_rate_limit() {
    let tmp = TempDir::new().unwrap();
    let target = Arc::new(
        ScriptedTarget::new().fail_with("second", [TargetError::status(429, "slow down")]),
    );
    let svc = service(&tmp, Arc::clone(&target));

    let config = OrchestratorConfig::new(OrchestratorType::PromptSend, alice())
        .with_param("dataset", json!("d1"));
    let orchestrator_id = svc.create_orchestrator(config).await.unwrap();

    let execution_id = svc
        .execute(&orchestrator_id, request(&["first", "second", "third"], ExecutionMode::Full))
        .await
        .unwrap();
    let run = svc.wait_for_execution(&execution_id).await.unwrap();

    assert_eq!(run.status, ExecutionStatus::Completed);
    assert_eq!(run.counts.total_prompts, 3);
    assert_eq!(run.counts.succeeded, 3);
    assert_eq!(run.counts.failed, 0);
    assert_eq!(run.counts.retried, 1);
    assert_eq!(run.dataset.as_deref(), Some("d1"));
    assert!(run.expected_span.is_none());
    assert_eq!(target.calls(), 4);

    let status = svc.get_execution_status(&execution_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Completed);
    assert_eq!(status.scores.len(), 3);
    assert!(status.scores.iter().all(|s| s.scorer == "refusal"));
    assert!(status.is_complete);
    assert_eq!(status.completion_rate, 1.0);

    let rate = svc.completion_rate(&alice(), &ExecutionFilters::default()).await.unwrap();
    assert_eq!(rate, 1.0);
}

#[tokio::test(start_paused = true)]
async fn auth_failure_is_a_result_not_a_run_failure() {
    let tmp = TempDir::new().unwrap();
    let target =
        Arc::new(ScriptedTarget::new().fail_with("bad", [TargetError::status(401, "nope")]));
    let svc = service(&tmp, Arc::clone(&target));

    let id = svc
        .create_orchestrator(OrchestratorConfig::new(OrchestratorType::PromptSend, alice()))
        .await
        .unwrap();
    let execution_id = svc
        .execute(&id, request(&["good", "bad"], ExecutionMode::Full))
        .await
        .unwrap();
    let run = svc.wait_for_execution(&execution_id).await.unwrap();

    assert_eq!(run.status, ExecutionStatus::Completed);
    assert_eq!(run.counts.succeeded, 1);
    assert_eq!(run.counts.failed, 1);
    assert_eq!(run.counts.retried, 0);
    // Never retried.
    assert_eq!(target.calls(), 2);

    let status = svc.get_execution_status(&execution_id).await.unwrap();
    assert_eq!(status.scores.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_end_as_failed_prompt() {
    let tmp = TempDir::new().unwrap();
    let target = Arc::new(
        ScriptedTarget::new()
            .fail_with("busy", std::iter::repeat_n(TargetError::status(503, ""), 10)),
    );
    let svc = service(&tmp, Arc::clone(&target));
    let id = svc
        .create_orchestrator(OrchestratorConfig::new(OrchestratorType::PromptSend, alice()))
        .await
        .unwrap();

    let execution_id = svc.execute(&id, request(&["busy"], ExecutionMode::Test)).await.unwrap();
    let run = svc.wait_for_execution(&execution_id).await.unwrap();

    assert_eq!(run.status, ExecutionStatus::Completed);
    assert_eq!(run.counts.failed, 1);
    assert_eq!(run.counts.retried, 2);
    assert_eq!(target.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn multi_batch_run_records_every_batch() {
    let tmp = TempDir::new().unwrap();
    let svc = service(&tmp, Arc::new(ScriptedTarget::new()));
    let config = OrchestratorConfig::new(OrchestratorType::BatchPromptSend, alice())
        .with_param("batch_size", json!(2))
        .with_param("concurrency", json!(2));
    let id = svc.create_orchestrator(config).await.unwrap();

    let execution_id = svc
        .execute(&id, request(&["a", "b", "c", "d", "e"], ExecutionMode::Test))
        .await
        .unwrap();
    let run = svc.wait_for_execution(&execution_id).await.unwrap();
    assert_eq!(run.status, ExecutionStatus::Completed);
    assert_eq!(run.total_batches, Some(3));

    let status = svc.get_execution_status(&execution_id).await.unwrap();
    assert_eq!(status.expected_batches, Some(3));
    assert_eq!(status.batches_recorded, 3);
    assert!(status.is_complete);
    assert_eq!(status.scores.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn caller_slice_is_judged_on_its_own_span() {
    let tmp = TempDir::new().unwrap();
    let svc = service(&tmp, Arc::new(ScriptedTarget::new()));
    let id = svc
        .create_orchestrator(OrchestratorConfig::new(OrchestratorType::PromptSend, alice()))
        .await
        .unwrap();

    let mut req = request(&["x", "y"], ExecutionMode::Test);
    req.batch = Some(BatchSlice { index: 2, total: 57 });
    let execution_id = svc.execute(&id, req).await.unwrap();
    let run = svc.wait_for_execution(&execution_id).await.unwrap();

    assert_eq!(run.status, ExecutionStatus::Completed);
    assert_eq!(run.batch_index, Some(2));
    assert_eq!(run.total_batches, Some(57));

    let status = svc.get_execution_status(&execution_id).await.unwrap();
    assert!(status.is_complete);
    assert_eq!(status.expected_batches, Some(1));
}

#[tokio::test(start_paused = true)]
async fn cancel_keeps_in_flight_results() {
    let tmp = TempDir::new().unwrap();
    let target = Arc::new(ScriptedTarget::new().with_delay(Duration::from_secs(1)));
    let svc = service(&tmp, Arc::clone(&target));
    let id = svc
        .create_orchestrator(OrchestratorConfig::new(OrchestratorType::PromptSend, alice()))
        .await
        .unwrap();

    let prompts: Vec<String> = (0..10).map(|i| format!("p{i}")).collect();
    let prompt_refs: Vec<&str> = prompts.iter().map(String::as_str).collect();
    let execution_id = svc.execute(&id, request(&prompt_refs, ExecutionMode::Test)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(svc.cancel(&execution_id).await.unwrap());

    let run = svc.wait_for_execution(&execution_id).await.unwrap();
    assert_eq!(run.status, ExecutionStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("cancelled"));
    assert!(run.counts.succeeded >= 1);
    assert!(run.counts.succeeded < 10);
    // Every delivery that was started reached a recorded result.
    assert_eq!(run.counts.terminal() as usize, target.calls());

    // Nothing left to cancel.
    assert!(!svc.cancel(&execution_id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn run_timeout_fails_the_run() {
    let tmp = TempDir::new().unwrap();
    let target = Arc::new(ScriptedTarget::new().with_delay(Duration::from_secs(10)));
    let config = CoreConfig::new(tmp.path().join("stores"), "s").with_execution(ExecutionConfig {
        run_timeout_secs: 5,
        ..Default::default()
    });
    let svc = Arc::new(OrchestratorService::new(config, target).unwrap());
    let id = svc
        .create_orchestrator(OrchestratorConfig::new(OrchestratorType::PromptSend, alice()))
        .await
        .unwrap();

    let execution_id = svc.execute(&id, request(&["slow"], ExecutionMode::Test)).await.unwrap();
    let run = svc.wait_for_execution(&execution_id).await.unwrap();
    assert_eq!(run.status, ExecutionStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("timed out"));
}

#[tokio::test(start_paused = true)]
async fn list_executions_is_per_user() {
    let tmp = TempDir::new().unwrap();
    let svc = service(&tmp, Arc::new(ScriptedTarget::new()));
    let bob = UserIdentity::parse("Bob").unwrap();

    let alice_id = assert_ok!(
        svc.create_orchestrator(OrchestratorConfig::new(OrchestratorType::PromptSend, alice()))
            .await
    );
    let bob_id = assert_ok!(
        svc.create_orchestrator(OrchestratorConfig::new(OrchestratorType::PromptSend, bob.clone()))
            .await
    );
    assert_ne!(alice_id, bob_id);

    for _ in 0..2 {
        let e = svc.execute(&alice_id, request(&["a"], ExecutionMode::Test)).await.unwrap();
        svc.wait_for_execution(&e).await.unwrap();
    }
    let e = svc.execute(&bob_id, request(&["b"], ExecutionMode::Full)).await.unwrap();
    svc.wait_for_execution(&e).await.unwrap();

    let alice_runs = svc.list_executions(&alice(), &ExecutionFilters::default()).await.unwrap();
    assert_eq!(alice_runs.len(), 2);
    assert!(alice_runs.iter().all(|r| r.user_id == "alice"));

    let bob_runs = svc
        .list_executions(
            &UserIdentity::parse(" BOB ").unwrap(),
            &ExecutionFilters {
                mode: Some(ExecutionMode::Full),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(bob_runs.len(), 1);
    assert_eq!(svc.execution_owner(&e).await.unwrap(), bob);

    // Two users, two stores; never more.
    let stores = std::fs::read_dir(tmp.path().join("stores"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.starts_with("memory_") && name.ends_with(".store")
        })
        .count();
    assert_eq!(stores, 2);
}

#[tokio::test(start_paused = true)]
async fn ids_resolve_after_restart() {
    let tmp = TempDir::new().unwrap();
    let config = || {
        OrchestratorConfig::new(OrchestratorType::PromptSend, alice())
            .with_param("dataset", json!("d1"))
    };

    let (orchestrator_id, execution_id) = {
        let svc = service(&tmp, Arc::new(ScriptedTarget::new()));
        let orchestrator_id = svc.create_orchestrator(config()).await.unwrap();
        let execution_id = svc
            .execute(&orchestrator_id, request(&["a", "b"], ExecutionMode::Test))
            .await
            .unwrap();
        svc.wait_for_execution(&execution_id).await.unwrap();
        svc.shutdown().await.unwrap();
        (orchestrator_id, execution_id)
    };

    let svc = service(&tmp, Arc::new(ScriptedTarget::new()));

    let status = svc.get_execution_status(&execution_id).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::Completed);
    assert_eq!(status.orchestrator_id, orchestrator_id);
    assert_eq!(status.scores.len(), 2);
    assert_eq!(svc.execution_owner(&execution_id).await.unwrap(), alice());
    assert!(!svc.cancel(&execution_id).await.unwrap());
    let run = svc.wait_for_execution(&execution_id).await.unwrap();
    assert_eq!(run.counts.succeeded, 2);

    let summary = svc.get_orchestrator(&orchestrator_id).await.unwrap();
    assert!(!summary.pooled);
    assert_eq!(summary.user, alice());

    // The same config maps back onto the id registered before the restart.
    assert_eq!(svc.create_orchestrator(config()).await.unwrap(), orchestrator_id);

    let next = svc
        .execute(&orchestrator_id, request(&["c"], ExecutionMode::Test))
        .await
        .unwrap();
    let run = svc.wait_for_execution(&next).await.unwrap();
    assert_eq!(run.status, ExecutionStatus::Completed);
    assert_eq!(run.orchestrator_id, orchestrator_id);
}

#[tokio::test]
async fn teardown_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let orchestrator_id = {
        let svc = service(&tmp, Arc::new(ScriptedTarget::new()));
        let id = svc
            .create_orchestrator(OrchestratorConfig::new(OrchestratorType::PromptSend, alice()))
            .await
            .unwrap();
        assert!(svc.teardown_orchestrator(&id).await.unwrap());
        svc.shutdown().await.unwrap();
        id
    };

    let svc = service(&tmp, Arc::new(ScriptedTarget::new()));
    let err = svc.get_orchestrator(&orchestrator_id).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(!svc.teardown_orchestrator(&orchestrator_id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn full_mode_spaces_out_deliveries() {
    let tmp = TempDir::new().unwrap();
    let target = Arc::new(ScriptedTarget::new());
    let svc = service(&tmp, Arc::clone(&target));
    let gap = svc.config().retry.policy(ExecutionMode::Full).inter_item_delay();
    assert!(!gap.is_zero());

    let config = OrchestratorConfig::new(OrchestratorType::PromptSend, alice())
        .with_param("concurrency", json!(1));
    let id = svc.create_orchestrator(config).await.unwrap();

    let dispatched = tokio::time::Instant::now();
    let execution_id = svc
        .execute(&id, request(&["one", "two", "three"], ExecutionMode::Full))
        .await
        .unwrap();
    svc.wait_for_execution(&execution_id).await.unwrap();

    let started = target.call_times();
    assert_eq!(started.len(), 3);
    // No wait before the first prompt, one gap before each later one.
    assert!(started[0] - dispatched < gap);
    assert!(started[1] - started[0] >= gap);
    assert!(started[2] - started[1] >= gap);
    assert!(started[2] - dispatched >= gap * 2);
}

#[tokio::test(start_paused = true)]
async fn retry_logs_carry_run_ids() {
    let lines = Arc::new(Mutex::new(Vec::<u8>::new()));
    let sink = Arc::clone(&lines);
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(move || LogSink(Arc::clone(&sink)))
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let tmp = TempDir::new().unwrap();
    let target = Arc::new(
        ScriptedTarget::new().fail_with("flaky", [TargetError::status(503, "unavailable")]),
    );
    let svc = service(&tmp, target);
    let orchestrator_id = svc
        .create_orchestrator(OrchestratorConfig::new(OrchestratorType::PromptSend, alice()))
        .await
        .unwrap();
    let execution_id = svc
        .execute(&orchestrator_id, request(&["flaky"], ExecutionMode::Test))
        .await
        .unwrap();
    svc.wait_for_execution(&execution_id).await.unwrap();

    let output = String::from_utf8(lines.lock().unwrap().clone()).unwrap();
    let retries: Vec<&str> = output
        .lines()
        .filter(|l| l.contains("Retryable delivery error"))
        .collect();
    assert_eq!(retries.len(), 1, "log output:\n{output}");
    assert!(retries[0].contains(&execution_id));
    assert!(retries[0].contains(&orchestrator_id));
}

/// In-memory log writer
struct LogSink(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut lines) = self.0.lock() {
            lines.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn second_process_on_same_store_is_busy() {
    let tmp = TempDir::new().unwrap();
    let one = service(&tmp, Arc::new(ScriptedTarget::new()));
    let two = service(&tmp, Arc::new(ScriptedTarget::new()));

    assert_ok!(
        one.create_orchestrator(OrchestratorConfig::new(OrchestratorType::PromptSend, alice()))
            .await
    );
    let err = assert_err!(
        two.create_orchestrator(OrchestratorConfig::new(OrchestratorType::PromptSend, alice()))
            .await
    );
    assert!(err.is_store_busy());

    one.shutdown().await.unwrap();
    assert_ok!(
        two.create_orchestrator(OrchestratorConfig::new(OrchestratorType::PromptSend, alice()))
            .await
    );
}

#[tokio::test]
async fn salt_drift_is_refused() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("stores");
    assert_ok!(OrchestratorService::new(
        CoreConfig::new(&dir, "s"),
        Arc::new(ScriptedTarget::new())
    ));
    let other = CoreConfig::new(&dir, "other");
    let err = OrchestratorService::new(other, Arc::new(ScriptedTarget::new()))
        .err()
        .unwrap();
    assert!(matches!(err, vutf_core::Error::SaltMismatch { .. }));
}
