mod fixtures;

use anyhow::Result;
use memapp::ClientRequest;
use memapp::ClientResponse;
use pretty_assertions::assert_eq;
use state_engine::UserError;

/// Command retry idempotence test.
///
/// What does this test do?
///
/// - applies a command at sequence 1, then a duplicate of it at a later
///   index, and asserts the duplicate returns the cached outcome verbatim
///   instead of re-applying.
/// - does the same for a command whose state machine output is an error,
///   asserting the error replays identically.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn command_retry() -> Result<()> {
    fixtures::init_tracing();

    let harness = fixtures::EngineHarness::new(fixtures::test_config());

    harness.apply(fixtures::register(1, "c1", 5000, 100)).await?;

    tracing::info!("--- first application of sequence 1");
    let first = harness
        .apply(fixtures::command(
            2,
            1,
            1,
            ClientRequest::Put {
                key: "k".into(),
                value: "v1".into(),
            },
            200,
        ))
        .await?
        .outcome()
        .cloned()
        .expect("command must produce an outcome");
    assert_eq!(first.index, 2);
    assert_eq!(first.result, Ok(ClientResponse(None)));

    // Unrelated traffic moves the log forward.
    harness.apply(fixtures::configuration(3, 250)).await?;
    harness.apply(fixtures::configuration(4, 260)).await?;

    tracing::info!("--- leader failover retries sequence 1 at a later index");
    let retried = harness
        .apply(fixtures::command(
            5,
            1,
            1,
            ClientRequest::Put {
                key: "k".into(),
                value: "v1".into(),
            },
            300,
        ))
        .await?;
    assert_eq!(retried.index, 5);
    let replayed = retried.outcome().cloned().expect("retry must replay the outcome");
    assert_eq!(replayed, first);

    // Had the retry been re-applied, its outcome would have carried the
    // previous value `v1` instead of the cached `None`. The session still
    // accepts the next sequence normally.
    let check = harness
        .apply(fixtures::command(
            6,
            1,
            2,
            ClientRequest::Put {
                key: "k".into(),
                value: "v2".into(),
            },
            400,
        ))
        .await?
        .outcome()
        .cloned()
        .unwrap();
    assert_eq!(check.result, Ok(ClientResponse(Some("v1".into()))));

    tracing::info!("--- deterministic user errors replay identically");
    let failed = harness
        .apply(fixtures::command(
            7,
            1,
            3,
            ClientRequest::Fail { message: "boom".into() },
            500,
        ))
        .await?
        .outcome()
        .cloned()
        .unwrap();
    assert_eq!(failed.result, Err(UserError("boom".into())));

    let refailed = harness
        .apply(fixtures::command(
            8,
            1,
            3,
            ClientRequest::Fail { message: "boom".into() },
            600,
        ))
        .await?
        .outcome()
        .cloned()
        .unwrap();
    assert_eq!(refailed, failed);

    harness.engine.shutdown().await?;
    Ok(())
}
