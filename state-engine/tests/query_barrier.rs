mod fixtures;

use std::time::Duration;

use anyhow::Result;
use memapp::ClientRequest;
use memapp::ClientResponse;
use pretty_assertions::assert_eq;
use state_engine::EngineError;
use state_engine::QueryRequest;

fn get(session_id: u64, sequence: u64, min_index: u64, key: &str) -> QueryRequest<ClientRequest> {
    QueryRequest {
        session_id,
        sequence,
        min_index,
        data: ClientRequest::Get { key: key.into() },
    }
}

/// Query index-barrier test.
///
/// What does this test do?
///
/// - submits a query with a barrier ahead of `last_applied` and asserts it
///   does not run until the barrier index is applied.
/// - asserts the admitted query executes at the engine's applied index, not
///   at its barrier, and observes every prior write.
/// - asserts queries for unknown sessions are rejected and queries never
///   advance the applied index.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn query_barrier() -> Result<()> {
    fixtures::init_tracing();

    let harness = fixtures::EngineHarness::new(fixtures::test_config());

    harness.apply(fixtures::register(1, "c1", 5000, 100)).await?;
    harness
        .apply(fixtures::command(
            2,
            1,
            1,
            ClientRequest::Put {
                key: "k".into(),
                value: "old".into(),
            },
            200,
        ))
        .await?;

    tracing::info!("--- a query with min_index=7 parks while last_applied=2");
    let engine = harness.engine.clone();
    let parked = tokio::spawn(async move { engine.query(get(1, 1, 7, "k")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!parked.is_finished(), "query must wait for its barrier");

    tracing::info!("--- unrelated entries advance the log to the barrier");
    for index in 3..=6 {
        harness.apply(fixtures::configuration(index, 200 + index)).await?;
    }
    harness
        .apply(fixtures::command(
            7,
            1,
            2,
            ClientRequest::Put {
                key: "k".into(),
                value: "new".into(),
            },
            300,
        ))
        .await?;

    let outcome = parked.await??;
    assert_eq!(outcome.index, 7);
    // The admitted query observes the write at its barrier.
    assert_eq!(outcome.result, Ok(ClientResponse(Some("new".into()))));

    tracing::info!("--- a satisfied barrier runs immediately at last_applied");
    let outcome = harness.engine.query(get(1, 2, 2, "k")).await?;
    assert_eq!(outcome.index, 7);

    tracing::info!("--- queries never advance the applied index");
    assert_eq!(harness.engine.metrics().borrow().last_applied, 7);

    tracing::info!("--- unknown sessions are rejected");
    let err = harness.engine.query(get(9, 1, 0, "k")).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownSession(9)), "got {:?}", err);

    tracing::info!("--- parked queries fail when their session unregisters");
    let engine = harness.engine.clone();
    let orphaned = tokio::spawn(async move { engine.query(get(1, 3, 100, "k")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.apply(fixtures::unregister(8, 1, false, 400)).await?;
    let err = orphaned.await?.unwrap_err();
    assert!(matches!(err, EngineError::UnknownSession(1)), "got {:?}", err);

    harness.engine.shutdown().await?;
    Ok(())
}
