mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use memapp::ClientRequest;
use memapp::ClientResponse;
use pretty_assertions::assert_eq;
use state_engine::storage::EngineStorage;
use state_engine::Config;
use state_engine::QueryRequest;
use state_engine::SnapshotPolicy;

fn snapshot_config() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .session_timeout_min(1)
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(10))
            .validate()
            .expect("failed to build engine config"),
    )
}

async fn wait_for<F: Fn() -> bool>(cond: F, msg: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timeout waiting for {}", msg);
}

/// Snapshot completion safety test.
///
/// What does this test do?
///
/// - takes a snapshot while a session still has unacknowledged events and
///   asserts it stays pending: a snapshot must not be exposed while replay
///   from it would lose events.
/// - acknowledges the events via keep-alive and asserts the snapshot is
///   finalized, the compactor's snapshot index advances, and compaction runs.
/// - restarts the engine over the same storage and asserts the snapshot is
///   installed and the state machine state is restored.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn snapshot_completion() -> Result<()> {
    fixtures::init_tracing();

    let config = snapshot_config();
    let harness = fixtures::EngineHarness::new(config.clone());

    harness.apply(fixtures::register(1, "c1", 5000, 100)).await?;
    harness.apply(fixtures::publish(2, 1, 1, vec!["x"], 200)).await?;
    harness
        .apply(fixtures::command(
            3,
            1,
            2,
            ClientRequest::Put {
                key: "k".into(),
                value: "v".into(),
            },
            300,
        ))
        .await?;
    for index in 4..=10 {
        harness.apply(fixtures::configuration(index, 300 + index)).await?;
    }
    harness.engine.wait(None).applied(10, "fill").await?;

    tracing::info!("--- snapshot written but held pending by unacked events");
    let storage = harness.storage.clone();
    wait_for(|| storage.snapshot_data(10).is_some(), "snapshot write-out").await;
    assert_eq!(harness.storage.current_snapshot().await?, None);
    assert_eq!(harness.engine.metrics().borrow().snapshot_index, 0);

    tracing::info!("--- keep-alive acknowledges the events, snapshot finalizes");
    harness.apply(fixtures::keep_alive(11, 1, 2, 2, 500)).await?;
    let metrics = harness.engine.wait(None).snapshot(10, "finalize").await?;
    assert!(metrics.last_completed >= 10);

    let meta = harness.storage.current_snapshot().await?.expect("snapshot must be current");
    assert_eq!(meta.index, 10);
    assert_eq!(harness.storage.snapshot_index().await?, 10);
    wait_for(|| storage.compaction_runs() > 0, "compaction pass").await;

    tracing::info!("--- a restarted engine installs the snapshot");
    let restarted = harness.restart(config);
    restarted.engine.wait(None).applied(10, "install").await?;
    assert_eq!(restarted.engine.metrics().borrow().snapshot_index, 10);

    tracing::info!("--- restored state serves reads");
    restarted.apply(fixtures::register(12, "c2", 5000, 600)).await?;
    let outcome = restarted
        .engine
        .query(QueryRequest {
            session_id: 12,
            sequence: 1,
            min_index: 12,
            data: ClientRequest::Get { key: "k".into() },
        })
        .await?;
    assert_eq!(outcome.result, Ok(ClientResponse(Some("v".into()))));

    harness.engine.shutdown().await?;
    restarted.engine.shutdown().await?;
    Ok(())
}
