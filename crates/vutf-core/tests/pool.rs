//! Pool and connection guarantees under concurrency.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

use vutf_core::config::PoolConfig;
use vutf_core::target::ScriptedTarget;
use vutf_core::{
    ConnectionManager, CoreConfig, ExecuteRequest, ExecutionMode, ExecutionStatus,
    OrchestratorConfig, OrchestratorInstance, OrchestratorPool, OrchestratorService,
    OrchestratorType, UserIdentity, resolver,
};

fn config() -> OrchestratorConfig {
    OrchestratorConfig::new(OrchestratorType::PromptSend, UserIdentity::parse("alice").unwrap())
        .with_param("dataset", json!("d1"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_creators_share_one_instance() {
    let tmp = TempDir::new().unwrap();
    let connections = Arc::new(ConnectionManager::new(Duration::ZERO));
    let pool = Arc::new(OrchestratorPool::new(PoolConfig::default(), Arc::clone(&connections)));
    let path = resolver::resolve(tmp.path(), &config().user, "s");
    let invoked = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let connections = Arc::clone(&connections);
            let path = path.clone();
            let invoked = Arc::clone(&invoked);
            tokio::spawn(async move {
                pool.get_or_create(&config(), |c| async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    // Widen the race window.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let handle = connections.acquire(&path).await?;
                    OrchestratorInstance::new(Uuid::new_v4(), c, handle)
                })
                .await
                .unwrap()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for task in tasks {
        ids.insert(task.await.unwrap().id());
    }

    assert_eq!(ids.len(), 1);
    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(connections.open_count(&path), 1);
    assert_eq!(connections.open_handles().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_service_requests_open_one_store() {
    let tmp = TempDir::new().unwrap();
    let core = CoreConfig::new(tmp.path(), "s");
    let svc = Arc::new(OrchestratorService::new(core, Arc::new(ScriptedTarget::new())).unwrap());

    let (a, b) = tokio::join!(
        svc.create_orchestrator(config()),
        svc.create_orchestrator(config())
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(svc.pool_stats().created, 1);

    let path = svc.store_path(&config().user);
    assert_eq!(svc.connections().open_count(&path), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_orchestrator_is_rebuilt_under_same_id() {
    let tmp = TempDir::new().unwrap();
    let core = CoreConfig::new(tmp.path(), "s").with_pool(PoolConfig {
        ttl_secs: 60,
        ..Default::default()
    });
    let svc = Arc::new(OrchestratorService::new(core, Arc::new(ScriptedTarget::new())).unwrap());

    let id = svc.create_orchestrator(config()).await.unwrap();

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(!svc.get_orchestrator(&id).await.unwrap().pooled);
    assert_eq!(svc.sweep().await.unwrap().orchestrators_expired, 1);

    let execution_id = svc
        .execute(
            &id,
            ExecuteRequest {
                prompts: vec!["hi".into()],
                mode: ExecutionMode::Test,
                batch: None,
            },
        )
        .await
        .unwrap();
    let run = svc.wait_for_execution(&execution_id).await.unwrap();
    assert_eq!(run.status, ExecutionStatus::Completed);
    assert_eq!(run.orchestrator_id, id);

    let summary = svc.get_orchestrator(&id).await.unwrap();
    assert!(summary.pooled);
    assert_eq!(svc.pool_stats().created, 2);

    // Same store file the whole time.
    let path = svc.store_path(&config().user);
    assert_eq!(svc.connections().open_count(&path), 1);
}

#[test]
fn resolve_is_deterministic_and_user_specific() {
    let dir = std::path::Path::new("/data/stores");
    let alice = UserIdentity::parse("alice").unwrap();
    let alice_again = UserIdentity::parse("  ALICE").unwrap();
    let bob = UserIdentity::parse("bob").unwrap();

    assert_eq!(resolver::resolve(dir, &alice, "s"), resolver::resolve(dir, &alice_again, "s"));
    assert_ne!(resolver::resolve(dir, &alice, "s"), resolver::resolve(dir, &bob, "s"));
    assert_ne!(resolver::resolve(dir, &alice, "s"), resolver::resolve(dir, &alice, "t"));
}
