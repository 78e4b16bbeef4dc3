mod fixtures;

use std::time::Duration;

use anyhow::Result;
use memapp::ClientRequest;
use memapp::ClientResponse;
use pretty_assertions::assert_eq;
use state_engine::entry::Entry;
use state_engine::entry::EntryPayload;
use state_engine::AppliedData;
use state_engine::EngineError;
use state_engine::QueryRequest;

/// Entry dispatcher contract test.
///
/// What does this test do?
///
/// - drives the log cursor through `apply_up_to` and `apply_index` and
///   asserts `last_applied` advances monotonically.
/// - asserts compacted positions (absent or tombstoned) are skipped while
///   still advancing `last_applied` and unblocking queries parked on them.
/// - asserts an entry carrying the wrong index halts the engine.
/// - asserts a closed log fails pending and new operations.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn dispatcher_contract() -> Result<()> {
    fixtures::init_tracing();

    let harness = fixtures::EngineHarness::new(fixtures::test_config());

    // Seed the log; only then drive the cursor.
    harness.storage.append(fixtures::register(1, "c1", 5000, 100)).await;
    harness
        .storage
        .append(fixtures::command(
            2,
            1,
            1,
            ClientRequest::Put {
                key: "k".into(),
                value: "v".into(),
            },
            200,
        ))
        .await;
    // Indices 3 and 4 were removed by compaction; 5 survives.
    harness.storage.append(fixtures::echo(5, 1, 2, "A", 300)).await;

    tracing::info!("--- apply the session and command through the cursor");
    harness.engine.apply_up_to(2)?;
    harness.engine.wait(None).applied(2, "watermark").await?;

    tracing::info!("--- a query parked on a compacted index still unblocks");
    let engine = harness.engine.clone();
    let parked = tokio::spawn(async move {
        engine
            .query(QueryRequest {
                session_id: 1,
                sequence: 1,
                min_index: 4,
                data: ClientRequest::Get { key: "k".into() },
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!parked.is_finished(), "barrier index 4 is not applied yet");

    let res = harness.engine.apply_index(5).await?;
    assert_eq!(res.index, 5);
    let outcome = res.outcome().cloned().unwrap();
    assert_eq!(outcome.result, Ok(ClientResponse(Some("A-ok".into()))));
    assert_eq!(harness.engine.metrics().borrow().last_applied, 5);

    let parked = parked.await??;
    assert!(parked.index >= 4, "query ran at the applied index, got {}", parked.index);
    assert_eq!(parked.result, Ok(ClientResponse(Some("v".into()))));

    tracing::info!("--- an explicit tombstone advances the cursor with no effect");
    let res = harness
        .apply(Entry {
            index: 6,
            term: 1,
            timestamp: 400,
            payload: EntryPayload::Tombstone,
        })
        .await?;
    assert!(matches!(res.data, AppliedData::None));
    assert_eq!(harness.engine.metrics().borrow().last_applied, 6);

    tracing::info!("--- re-applying an old index is an idempotent no-op");
    let res = harness.engine.apply_index(2).await?;
    assert!(matches!(res.data, AppliedData::None));
    assert_eq!(harness.engine.metrics().borrow().last_applied, 6);

    tracing::info!("--- an index mismatch is fatal");
    harness.storage.append_at(7, fixtures::configuration(9, 500)).await;
    let err = harness.engine.apply_index(7).await.unwrap_err();
    assert!(matches!(err, EngineError::ShuttingDown), "got {:?}", err);
    // The engine has halted: everything after the fault is rejected.
    let err = harness.engine.apply_index(8).await.unwrap_err();
    assert!(matches!(err, EngineError::ShuttingDown), "got {:?}", err);

    Ok(())
}

/// A closed log fails all pending and new operations.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn closed_log_rejects_operations() -> Result<()> {
    fixtures::init_tracing();

    let harness = fixtures::EngineHarness::new(fixtures::test_config());
    harness.apply(fixtures::register(1, "c1", 5000, 100)).await?;

    // Park a query, then pull the log out from underneath it.
    let engine = harness.engine.clone();
    let parked = tokio::spawn(async move {
        engine
            .query(QueryRequest {
                session_id: 1,
                sequence: 1,
                min_index: 100,
                data: ClientRequest::Get { key: "k".into() },
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.storage.close();

    let err = harness.apply(fixtures::echo(2, 1, 1, "A", 200)).await.unwrap_err();
    assert!(matches!(err, EngineError::LogClosed), "got {:?}", err);

    // The closure surfaced to the parked query as well.
    let err = parked.await?.unwrap_err();
    assert!(matches!(err, EngineError::LogClosed), "got {:?}", err);

    let err = harness
        .engine
        .query(QueryRequest {
            session_id: 1,
            sequence: 1,
            min_index: 0,
            data: ClientRequest::Get { key: "k".into() },
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LogClosed), "got {:?}", err);

    harness.engine.shutdown().await?;
    Ok(())
}
