//! Public engine interface and data types.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::EngineCore;
use crate::entry::Entry;
use crate::error::EngineError;
use crate::error::EngineResult;
use crate::error::UserError;
use crate::machine::EventTransport;
use crate::machine::SessionListener;
use crate::machine::StateMachine;
use crate::metrics::EngineMetrics;
use crate::metrics::Wait;
use crate::storage::EngineStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::SessionId;

struct EngineInner<D, R, M, S, T>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
    S: EngineStorage<D>,
    T: EventTransport,
{
    tx_api: mpsc::UnboundedSender<(EngineMsg<D, R>, Span)>,
    rx_metrics: watch::Receiver<EngineMetrics>,
    engine_handle: Mutex<Option<JoinHandle<EngineResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_m: std::marker::PhantomData<M>,
    marker_s: std::marker::PhantomData<S>,
    marker_t: std::marker::PhantomData<T>,
}

/// The engine API.
///
/// This type is the interface to a running state machine engine. The
/// consensus layer hands it committed entries; clients' queries and event
/// acknowledgements are routed through it as well.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone
/// itself is very cheap and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns `EngineError::ShuttingDown`, the engine
/// task has stopped (either by request or because a structural error such as
/// an inconsistent index halted application), and `shutdown` should be called
/// to await the task and observe its final result.
pub struct StateEngine<D, R, M, S, T>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
    S: EngineStorage<D>,
    T: EventTransport,
{
    inner: Arc<EngineInner<D, R, M, S, T>>,
}

impl<D, R, M, S, T> StateEngine<D, R, M, S, T>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
    S: EngineStorage<D>,
    T: EventTransport,
{
    /// Create and spawn a new engine task.
    ///
    /// ### `config`
    /// The engine's runtime config. See the docs on the `Config` object for
    /// more details.
    ///
    /// ### `machine`
    /// The application state machine. Moved onto the engine's application
    /// task, which serializes every callback.
    ///
    /// ### `listeners`
    /// Session lifecycle observers, invoked in the given order on every
    /// transition.
    ///
    /// ### `storage`
    /// The committed log, compactor and snapshot store surface.
    ///
    /// ### `transport`
    /// The outbound path for session event batches.
    #[tracing::instrument(level="trace", skip(config, machine, listeners, storage, transport), fields(cluster=%config.cluster_name))]
    pub fn new(
        config: Arc<Config>,
        machine: M,
        listeners: Vec<Box<dyn SessionListener>>,
        storage: Arc<S>,
        transport: Arc<T>,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(EngineMetrics::new_initial(config.cluster_name.clone()));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let engine_handle =
            EngineCore::spawn(config, machine, listeners, storage, transport, rx_api, tx_metrics, rx_shutdown);
        let inner = EngineInner {
            tx_api,
            rx_metrics,
            engine_handle: Mutex::new(Some(engine_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_m: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
            marker_t: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Apply committed entries up to and including `index`, best effort.
    ///
    /// Entries are read from the log and applied in order; failures are
    /// logged on the engine task rather than surfaced here.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn apply_up_to(&self, index: u64) -> EngineResult<()> {
        let span = tracing::debug_span!("CH");
        self.inner
            .tx_api
            .send((EngineMsg::ApplyUpTo { index }, span))
            .map_err(|_| EngineError::ShuttingDown)
    }

    /// Apply committed entries up to and including `index`, awaiting the
    /// result of the entry at `index` along with any linearizable events
    /// bound to it.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn apply_index(&self, index: u64) -> EngineResult<ApplyResponse<R>> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((EngineMsg::ApplyIndex { index, tx }, span))
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown).and_then(|res| res)
    }

    /// Apply an already-read committed entry directly.
    ///
    /// Any earlier unapplied entries are read from the log and applied first,
    /// so the dispatcher's ordering contract holds.
    #[tracing::instrument(level = "debug", skip(self, entry), fields(entry=%entry.summary()))]
    pub async fn apply_entry(&self, entry: Entry<D>) -> EngineResult<ApplyResponse<R>> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((EngineMsg::ApplyEntry { entry, tx }, span))
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a read-only query.
    ///
    /// The query does not traverse the log: it waits until `last_applied`
    /// reaches `min_index` and then executes against the state at the
    /// engine's current applied index.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn query(&self, rpc: QueryRequest<D>) -> EngineResult<Outcome<R>> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((EngineMsg::Query { rpc, tx }, span))
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown).and_then(|res| res)
    }

    /// Feed a transport level event acknowledgement into the engine.
    ///
    /// Keep-alive entries remain the authoritative acknowledgement path;
    /// this lets a transport shorten the completion window between them.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn ack_events(&self, session_id: SessionId, event_index: u64) -> EngineResult<()> {
        let span = tracing::debug_span!("CH");
        self.inner
            .tx_api
            .send((EngineMsg::AckEvents { session_id, event_index }, span))
            .map_err(|_| EngineError::ShuttingDown)
    }

    /// The ids of sessions currently overdue on keep-alives.
    ///
    /// The engine never expires these itself; a leader integration may use
    /// this to decide which sessions to close through committed UNREGISTER
    /// entries.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn suspicious_sessions(&self) -> EngineResult<Vec<SessionId>> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((EngineMsg::SuspiciousSessions { tx }, span))
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<EngineMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// let timeout = Duration::from_millis(200);
    ///
    /// // wait for entry 3 to be applied:
    /// engine.wait(Some(timeout)).applied(3, "apply").await?;
    ///
    /// // wait for every session to acknowledge events through index 7:
    /// engine.wait(None).completed(7, "complete").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_millis(500),
        };
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown the engine.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.engine_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<D, R, M, S, T> Clone for StateEngine<D, R, M, S, T>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
    S: EngineStorage<D>,
    T: EventTransport,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type ApplyTx<R> = oneshot::Sender<EngineResult<ApplyResponse<R>>>;
pub(crate) type QueryTx<R> = oneshot::Sender<EngineResult<Outcome<R>>>;

/// A message coming from the engine API.
pub(crate) enum EngineMsg<D: AppData, R: AppDataResponse> {
    ApplyUpTo {
        index: u64,
    },
    ApplyIndex {
        index: u64,
        tx: ApplyTx<R>,
    },
    ApplyEntry {
        entry: Entry<D>,
        tx: ApplyTx<R>,
    },
    Query {
        rpc: QueryRequest<D>,
        tx: QueryTx<R>,
    },
    AckEvents {
        session_id: SessionId,
        event_index: u64,
    },
    SuspiciousSessions {
        tx: oneshot::Sender<Vec<SessionId>>,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A read-only query against the state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest<D: AppData> {
    /// The session submitting the query.
    pub session_id: SessionId,
    /// The client assigned sequence number, echoed back for client side
    /// ordering.
    pub sequence: u64,
    /// The index the query must not run before: the engine waits until
    /// `last_applied` reaches this barrier.
    pub min_index: u64,
    /// The application specific query payload.
    #[serde(bound = "D: AppData")]
    pub data: D,
}

impl<D: AppData> MessageSummary for QueryRequest<D> {
    fn summary(&self) -> String {
        format!("query session={} seq={} min-index={}", self.session_id, self.sequence, self.min_index)
    }
}

/// The result of applying a command or executing a query.
///
/// Cached per `(session, sequence)` for retried commands, so replays return
/// identical bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outcome<R: AppDataResponse> {
    /// The index the operation executed at.
    pub index: u64,
    /// The session's event index at completion.
    pub event_index: u64,
    /// The state machine output, or the deterministic error it produced.
    #[serde(bound = "R: AppDataResponse")]
    pub result: Result<R, UserError>,
}

/// The response to applying a single committed entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApplyResponse<R: AppDataResponse> {
    /// The index of the applied entry.
    pub index: u64,
    /// The application visible effect of the entry.
    #[serde(bound = "R: AppDataResponse")]
    pub data: AppliedData<R>,
}

/// The application visible effect of one applied entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AppliedData<R: AppDataResponse> {
    /// The entry had no application visible result.
    None,
    /// A REGISTER entry created this session.
    Session(SessionId),
    /// A COMMAND entry produced (or replayed) this outcome.
    #[serde(bound = "R: AppDataResponse")]
    Outcome(Outcome<R>),
}

impl<R: AppDataResponse> ApplyResponse<R> {
    /// The command outcome, if this entry produced one.
    pub fn outcome(&self) -> Option<&Outcome<R>> {
        match &self.data {
            AppliedData::Outcome(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// The registered session id, if this entry created a session.
    pub fn session_id(&self) -> Option<SessionId> {
        match &self.data {
            AppliedData::Session(id) => Some(*id),
            _ => None,
        }
    }
}
