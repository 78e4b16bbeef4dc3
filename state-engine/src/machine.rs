//! The user state machine interface and its collaborators.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::context::ApplyContext;
use crate::storage::SnapshotReader;
use crate::storage::SnapshotWriter;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::SessionId;

/// A committed operation handed to the state machine for application.
///
/// For commands this is the payload of a committed log entry; for queries it
/// is the query payload executed at the engine's current applied index. The
/// scope kind on the [`ApplyContext`] determines whether event publication is
/// permitted.
#[derive(Debug)]
pub struct Commit<D: AppData> {
    /// The log index this operation executes at. For queries this is the
    /// engine's `last_applied`, not a log position of the query itself.
    pub index: u64,
    /// Deterministic state machine time, in milliseconds.
    pub time: u64,
    /// The session which submitted the operation.
    pub session: SessionId,
    /// The application specific operation payload.
    pub operation: D,
}

/// A trait defining the application state machine driven by the engine.
///
/// Every method is invoked on the engine's single application task, in
/// committed log order, and must be deterministic: given the same sequence of
/// calls, every replica must produce the same outputs, the same events and
/// the same errors. Errors returned from `apply` are captured into the cached
/// result and surfaced to the client — they never fail the replica.
pub trait StateMachine<D, R>: Send + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// Invoked once when the engine starts, before any entry is applied.
    ///
    /// The context may be used to schedule deterministic callbacks.
    fn init(&mut self, ctx: &mut ApplyContext<Self>)
    where Self: Sized {
        let _ = ctx;
    }

    /// Apply a committed operation, returning the application response.
    fn apply(&mut self, ctx: &mut ApplyContext<Self>, commit: Commit<D>) -> Result<R>
    where Self: Sized;

    /// Whether this state machine supports snapshotting. A machine returning
    /// `false` here is never asked to snapshot and never drives the snapshot
    /// coordinator's take phase.
    fn supports_snapshot(&self) -> bool {
        false
    }

    /// Serialize the machine's state into the given writer.
    fn snapshot(&mut self, writer: &mut SnapshotWriter) -> Result<()> {
        let _ = writer;
        Ok(())
    }

    /// Replace the machine's state with the contents of the given reader.
    fn install(&mut self, reader: &mut SnapshotReader) -> Result<()> {
        let _ = reader;
        Ok(())
    }
}

/// A read-only view of a session, exposed to state machine callbacks and
/// session listeners.
///
/// The engine retains exclusive ownership of session records; callbacks see
/// only this stable subset of their attributes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// The session id, equal to the index of its REGISTER entry.
    pub id: SessionId,
    /// The application supplied client identity.
    pub client_id: String,
    /// The session timeout, in milliseconds.
    pub timeout: u64,
}

/// An ordered observer of session lifecycle transitions.
///
/// Listeners are passed to the engine at construction; their invocation order
/// on every transition is their construction order. All methods run on the
/// application task.
pub trait SessionListener: Send + 'static {
    /// A session was registered and opened.
    fn register(&mut self, session: &SessionInfo) {
        let _ = session;
    }

    /// A session was unregistered by its client.
    fn unregister(&mut self, session: &SessionInfo) {
        let _ = session;
    }

    /// A session was expired by a leader committed unregister.
    fn expire(&mut self, session: &SessionInfo) {
        let _ = session;
    }

    /// A session was closed.
    fn close(&mut self, session: &SessionInfo) {
        let _ = session;
    }
}

/// A trait defining how event batches leave the engine towards clients.
///
/// The engine publishes each batch once when it is produced and again on
/// keep-alive triggered resends; it never retries on its own. Transport
/// errors are logged and otherwise ignored — delivery is reconciled through
/// the per-session event chain and keep-alive acknowledgements.
#[async_trait]
pub trait EventTransport: Send + Sync + 'static {
    /// Send an event batch to the session's client.
    async fn publish(&self, request: PublishRequest) -> Result<()>;
}

/// A server-to-client event publication.
///
/// Batches published to one session form a chain: `previous_index` of each
/// batch equals `event_index` of the one before it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// The session the events belong to.
    pub session_id: SessionId,
    /// The `event_index` of the previous batch published to this session.
    pub previous_index: u64,
    /// The index of the entry whose command scope produced this batch.
    pub event_index: u64,
    /// The events, in publication order.
    pub events: Vec<Bytes>,
}

impl MessageSummary for PublishRequest {
    fn summary(&self) -> String {
        format!(
            "publish session={} prev={} index={} n={}",
            self.session_id,
            self.previous_index,
            self.event_index,
            self.events.len()
        )
    }
}

/// The client side response to a [`PublishRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublishResponse {
    /// Whether the batch was accepted. A `false` response asks the server to
    /// resend starting after `event_index`.
    pub ok: bool,
    /// The client's highest received event index.
    pub event_index: u64,
}
