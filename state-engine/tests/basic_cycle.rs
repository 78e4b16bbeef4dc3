mod fixtures;

use anyhow::Result;
use memapp::ClientResponse;
use pretty_assertions::assert_eq;
use state_engine::entry::CompactionMode;
use state_engine::AppliedData;

/// Session lifecycle basic cycle test.
///
/// What does this test do?
///
/// - registers a session and asserts its id is the REGISTER entry's index.
/// - applies a command and asserts the outcome shape.
/// - applies a keep-alive and asserts the cached response is evicted.
/// - unregisters and asserts listener ordering: unregister then close.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn basic_cycle() -> Result<()> {
    fixtures::init_tracing();

    let listener = fixtures::RecordingListener::new();
    let harness = fixtures::EngineHarness::with_listeners(fixtures::test_config(), vec![Box::new(listener.clone())]);

    tracing::info!("--- register session");
    let res = harness.apply(fixtures::register(1, "c1", 5000, 100)).await?;
    assert_eq!(res.session_id(), Some(1));
    assert_eq!(listener.calls(), vec!["register:1".to_string()]);

    tracing::info!("--- apply command");
    let res = harness.apply(fixtures::echo(2, 1, 1, "A", 200)).await?;
    let outcome = res.outcome().expect("command must produce an outcome").clone();
    assert_eq!(outcome.index, 2);
    assert_eq!(outcome.event_index, 0);
    assert_eq!(outcome.result, Ok(ClientResponse(Some("A-ok".into()))));

    // The command entry is retained while its response is cached.
    assert_eq!(harness.storage.released_mode(2), None);

    tracing::info!("--- keep-alive acknowledges the command");
    let res = harness.apply(fixtures::keep_alive(3, 1, 1, 0, 300)).await?;
    assert!(matches!(res.data, AppliedData::None));
    // Eviction of the cached response releases the command entry.
    assert_eq!(harness.storage.released_mode(2), Some(CompactionMode::Sequential));

    tracing::info!("--- unregister");
    harness.apply(fixtures::unregister(4, 1, false, 400)).await?;
    assert_eq!(
        listener.calls(),
        vec!["register:1".to_string(), "unregister:1".to_string(), "close:1".to_string()]
    );

    let metrics = harness.engine.wait(None).applied(4, "cycle").await?;
    assert_eq!(metrics.sessions, 0);

    tracing::info!("--- operations for the closed session fail");
    let err = harness.apply(fixtures::echo(5, 1, 2, "B", 500)).await.unwrap_err();
    assert!(matches!(err, state_engine::EngineError::UnknownSession(1)), "got {:?}", err);
    // A command for a dead session is retained only to quorum replication.
    assert_eq!(harness.storage.released_mode(5), Some(CompactionMode::Quorum));

    harness.engine.shutdown().await?;
    Ok(())
}
