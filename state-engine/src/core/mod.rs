//! The core logic of the state machine engine.

mod apply;
mod machine_task;
mod query;
mod snapshot;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::context::ScopeEvents;
use crate::context::SessionRoster;
use crate::core::machine_task::MachineCore;
use crate::core::machine_task::MachineTask;
use crate::core::snapshot::PendingSnapshot;
use crate::core::snapshot::SnapshotUpdate;
use crate::engine::ApplyResponse;
use crate::engine::ApplyTx;
use crate::engine::AppliedData;
use crate::engine::EngineMsg;
use crate::entry::CompactionMode;
use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::error::EngineError;
use crate::error::EngineResult;
use crate::machine::EventTransport;
use crate::machine::PublishRequest;
use crate::machine::SessionListener;
use crate::machine::StateMachine;
use crate::metrics::EngineMetrics;
use crate::metrics::EngineState;
use crate::session::SessionRegistry;
use crate::session::SessionState;
use crate::storage::EngineStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::SessionId;

/// The destination for the result of applying one entry.
#[derive(derive_more::From)]
pub(self) enum ApplyResponder<R: AppDataResponse> {
    /// An API caller awaiting the entry's result.
    Caller(ApplyTx<R>),
    /// A best-effort application with no caller attached.
    #[from(ignore)]
    Background,
}

impl<R: AppDataResponse> ApplyResponder<R> {
    fn respond(self, res: EngineResult<ApplyResponse<R>>) {
        match self {
            ApplyResponder::Caller(tx) => {
                let _ = tx.send(res);
            }
            ApplyResponder::Background => {
                if let Err(err) = res {
                    tracing::error!(error=%err, "error applying entry");
                }
            }
        }
    }
}

/// The core type implementing the engine context: entry dispatch, index
/// bookkeeping, session ownership and snapshot coordination.
pub(crate) struct EngineCore<D, R, S, T>
where
    D: AppData,
    R: AppDataResponse,
    S: EngineStorage<D>,
    T: EventTransport,
{
    config: Arc<Config>,
    storage: Arc<S>,
    transport: Arc<T>,

    /// The target operating state of the engine.
    state: EngineState,

    /// Deterministic state machine time: the maximum leader timestamp
    /// observed so far. Mirrors the application context's clock.
    time: u64,

    /// The index of the highest entry applied to the state machine.
    ///
    /// Monotonic; advanced for compacted entries as well, so queries waiting
    /// on an index always unblock.
    last_applied: u64,

    /// The highest index whose events every session has acknowledged,
    /// bounded above by `last_applied`.
    last_completed: u64,

    /// The compactor's snapshot index as last advanced by this engine.
    snapshot_index: u64,

    /// Whether the state machine supports snapshotting.
    snapshottable: bool,

    /// The at-most-one snapshot written but not yet finalized.
    pending_snapshot: Option<PendingSnapshot>,

    /// All live sessions, owned exclusively by this task.
    sessions: SessionRegistry<D, R>,

    tx_machine: mpsc::UnboundedSender<(MachineTask<D, R>, Span)>,

    tx_snapshot: mpsc::Sender<SnapshotUpdate>,
    rx_snapshot: mpsc::Receiver<SnapshotUpdate>,

    rx_api: mpsc::UnboundedReceiver<(EngineMsg<D, R>, Span)>,
    tx_metrics: watch::Sender<EngineMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D, R, S, T> EngineCore<D, R, S, T>
where
    D: AppData,
    R: AppDataResponse,
    S: EngineStorage<D>,
    T: EventTransport,
{
    pub(crate) fn spawn<M: StateMachine<D, R>>(
        config: Arc<Config>,
        machine: M,
        listeners: Vec<Box<dyn SessionListener>>,
        storage: Arc<S>,
        transport: Arc<T>,
        rx_api: mpsc::UnboundedReceiver<(EngineMsg<D, R>, Span)>,
        tx_metrics: watch::Sender<EngineMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<EngineResult<()>> {
        let (tx_machine, rx_machine) = mpsc::unbounded_channel();
        let _ = MachineCore::spawn(machine, listeners, rx_machine);
        let (tx_snapshot, rx_snapshot) = mpsc::channel(1);
        let this = Self {
            config,
            storage,
            transport,
            state: EngineState::Running,
            time: 0,
            last_applied: 0,
            last_completed: 0,
            snapshot_index: 0,
            snapshottable: false,
            pending_snapshot: None,
            sessions: SessionRegistry::new(),
            tx_machine,
            tx_snapshot,
            rx_snapshot,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the engine context.
    #[tracing::instrument(level="debug", skip(self), fields(cluster=%self.config.cluster_name))]
    async fn main(mut self) -> EngineResult<()> {
        tracing::debug!("engine is initializing");

        // Initialize the state machine before any entry is applied.
        let roster = self.build_roster();
        let (tx, rx) = oneshot::channel();
        self.send_machine(MachineTask::Init { roster, tx })?;
        let effect = rx.await.map_err(|_| EngineError::ShuttingDown)?;
        self.snapshottable = effect.snapshottable;

        // Recover from the current snapshot, if one exists.
        self.snapshot_index = self.storage.snapshot_index().await.map_err(|err| self.map_fatal_storage_error(err))?;
        let current = self.storage.current_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?;
        if let Some(meta) = current {
            if meta.index > self.last_applied {
                self.install_snapshot(&meta).await?;
                self.last_applied = meta.index;
                self.last_completed = meta.index;
            }
        }
        self.report_metrics();

        loop {
            if self.state == EngineState::Shutdown {
                tracing::info!("engine has shutdown");
                return Ok(());
            }

            tokio::select! {
                Some((msg, span)) = self.rx_api.recv() => {
                    self.handle_api_msg(msg).instrument(span).await;
                }
                Some(update) = self.rx_snapshot.recv() => {
                    self.handle_snapshot_update(update).await;
                }
                Ok(_) = &mut self.rx_shutdown => {
                    tracing::info!("engine received shutdown request");
                    self.state = EngineState::Shutdown;
                }
            }
        }
    }

    /// Route one API message; FIFO across concurrent callers is inherent in
    /// the serial processing of this mailbox.
    async fn handle_api_msg(&mut self, msg: EngineMsg<D, R>) {
        match msg {
            EngineMsg::ApplyUpTo { index } => {
                if let Err(err) = self.apply_to(index, ApplyResponder::Background).await {
                    tracing::error!(error=%err, index, "error applying entries");
                }
            }
            EngineMsg::ApplyIndex { index, tx } => {
                if let Err(err) = self.apply_to(index, tx.into()).await {
                    tracing::error!(error=%err, index, "error applying entries");
                }
            }
            EngineMsg::ApplyEntry { entry, tx } => {
                if let Err(err) = self.apply_read_entry(entry, tx).await {
                    tracing::error!(error=%err, "error applying entry");
                }
            }
            EngineMsg::Query { rpc, tx } => {
                self.handle_query(rpc, tx).await;
            }
            EngineMsg::AckEvents { session_id, event_index } => {
                self.handle_ack_events(session_id, event_index).await;
            }
            EngineMsg::SuspiciousSessions { tx } => {
                let _ = tx.send(self.collect_suspicious());
            }
        }
    }

    /// Apply entries from the log up to and including `target`, routing the
    /// result of the entry at `target` to `responder`.
    #[tracing::instrument(level = "debug", skip(self, responder))]
    async fn apply_to(&mut self, target: u64, responder: ApplyResponder<R>) -> EngineResult<()> {
        if !self.storage.is_open() {
            self.fail_waiting_queries();
            responder.respond(Err(EngineError::LogClosed));
            return Ok(());
        }
        if target <= self.last_applied {
            // Already applied; an idempotent no-op for the caller.
            responder.respond(Ok(ApplyResponse {
                index: target,
                data: AppliedData::None,
            }));
            return Ok(());
        }

        let last_index = self.storage.last_index().await.map_err(|err| self.map_fatal_storage_error(err))?;
        let target = match &responder {
            // Best effort: never run the cursor past the committed log.
            ApplyResponder::Background => target.min(last_index),
            ApplyResponder::Caller(_) => {
                if target > last_index {
                    // The caller named an index this log has never seen;
                    // the replica has diverged from consensus.
                    return Err(self.fail_fatal(EngineError::Internal(format!(
                        "cannot apply index {} beyond the committed log at {}",
                        target, last_index
                    ))));
                }
                target
            }
        };
        if target <= self.last_applied {
            responder.respond(Ok(ApplyResponse {
                index: target,
                data: AppliedData::None,
            }));
            return Ok(());
        }

        while self.last_applied + 1 < target {
            let next = self.last_applied + 1;
            match self.read_entry(next).await? {
                Some(entry) => self.apply_one(entry, ApplyResponder::Background).await?,
                None => self.set_last_applied(next).await?,
            }
        }

        // Exactly one read at the target index.
        match self.read_entry(target).await? {
            Some(entry) => self.apply_one(entry, responder).await,
            None => {
                self.set_last_applied(target).await?;
                responder.respond(Ok(ApplyResponse {
                    index: target,
                    data: AppliedData::None,
                }));
                Ok(())
            }
        }
    }

    /// Apply an entry the caller already read from the log, catching up on
    /// any earlier unapplied entries first.
    #[tracing::instrument(level="debug", skip(self, entry, tx), fields(entry=%entry.summary()))]
    async fn apply_read_entry(&mut self, entry: Entry<D>, tx: ApplyTx<R>) -> EngineResult<()> {
        if !self.storage.is_open() {
            self.fail_waiting_queries();
            let _ = tx.send(Err(EngineError::LogClosed));
            return Ok(());
        }
        if entry.index <= self.last_applied {
            let _ = tx.send(Ok(ApplyResponse {
                index: entry.index,
                data: AppliedData::None,
            }));
            return Ok(());
        }

        while self.last_applied + 1 < entry.index {
            let next = self.last_applied + 1;
            match self.read_entry(next).await? {
                Some(entry) => self.apply_one(entry, ApplyResponder::Background).await?,
                None => self.set_last_applied(next).await?,
            }
        }
        self.apply_one(entry, tx.into()).await
    }

    /// Read the entry at `index`, verifying the index it carries.
    ///
    /// Returns `None` for compacted positions, whether absent from the log or
    /// present as tombstones.
    async fn read_entry(&mut self, index: u64) -> EngineResult<Option<Entry<D>>> {
        let entry = self.storage.entry(index).await.map_err(|err| self.map_fatal_storage_error(err))?;
        match entry {
            Some(entry) if entry.index != index => Err(self.fail_fatal(EngineError::InconsistentIndex {
                requested: index,
                read: entry.index,
            })),
            Some(entry) if matches!(entry.payload, EntryPayload::Tombstone) => Ok(None),
            other => Ok(other),
        }
    }

    /// Route one entry to its typed handler and deliver the result.
    ///
    /// Session level errors are delivered to the responder and do not halt
    /// the engine; structural errors do.
    async fn apply_one(&mut self, entry: Entry<D>, responder: ApplyResponder<R>) -> EngineResult<()> {
        tracing::debug!(entry=%entry.summary(), "applying entry");
        let index = entry.index;
        let timestamp = entry.timestamp;
        let result = match entry.payload {
            EntryPayload::Register(register) => self.apply_register(index, timestamp, register).await,
            EntryPayload::KeepAlive(keep_alive) => self.apply_keep_alive(index, timestamp, keep_alive).await,
            EntryPayload::Unregister(unregister) => self.apply_unregister(index, timestamp, unregister).await,
            EntryPayload::Connect(connect) => self.apply_connect(index, timestamp, connect).await,
            EntryPayload::Command(command) => self.apply_command(index, timestamp, command).await,
            EntryPayload::Initialize => self.apply_initialize(index, timestamp).await,
            EntryPayload::Configuration => self.apply_configuration(index).await,
            EntryPayload::Tombstone => {
                self.set_last_applied(index).await?;
                Ok(ApplyResponse {
                    index,
                    data: AppliedData::None,
                })
            }
        };
        match result {
            Ok(response) => {
                responder.respond(Ok(response));
                Ok(())
            }
            Err(err) if err.is_fatal() => {
                responder.respond(Err(EngineError::ShuttingDown));
                Err(err)
            }
            Err(err) => {
                responder.respond(Err(err));
                Ok(())
            }
        }
    }

    /// Advance `last_applied` through every intermediate index, unblocking
    /// parked queries and driving the snapshot coordinator.
    pub(self) async fn set_last_applied(&mut self, index: u64) -> EngineResult<()> {
        if index <= self.last_applied {
            return Ok(());
        }
        self.last_applied = index;

        // Notify sessions: queries whose barrier any intermediate index
        // satisfies may now run. Compacted indices count — the barrier is a
        // position, not an entry.
        let mut ready = Vec::new();
        let ids = self.sessions.ids();
        for id in ids {
            if let Some(session) = self.sessions.lookup_mut(id) {
                for query in session.take_ready_queries(index) {
                    ready.push((id, query));
                }
            }
        }
        for (session_id, query) in ready {
            self.execute_query(session_id, query.sequence, query.data, query.tx).await;
        }

        self.maybe_take_snapshot().await?;
        self.maybe_install_snapshot().await?;
        self.update_last_completed().await?;
        self.report_metrics();
        Ok(())
    }

    /// Recompute `last_completed` from the per-session acknowledgement
    /// frontiers and drive snapshot completion.
    pub(self) async fn update_last_completed(&mut self) -> EngineResult<()> {
        let last_applied = self.last_applied;
        let completed = self
            .sessions
            .iter()
            .map(|session| session.complete_index(last_applied))
            .min()
            .unwrap_or(last_applied)
            .min(last_applied);
        if completed > self.last_completed {
            self.last_completed = completed;
            // Entries below the completion frontier are fair game for minor
            // compaction passes.
            self.storage.set_minor_index(completed).await.map_err(|err| self.map_fatal_storage_error(err))?;
            self.maybe_complete_snapshot().await?;
        }
        Ok(())
    }

    /// The ids of sessions currently overdue on keep-alives.
    ///
    /// The engine never removes these itself; a leader integration may use
    /// this to decide which sessions to expire through committed UNREGISTER
    /// entries.
    fn collect_suspicious(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|session| session.state == SessionState::Suspicious)
            .map(|session| session.id)
            .collect()
    }

    /// Feed a transport level acknowledgement into the session's event queue.
    async fn handle_ack_events(&mut self, session_id: SessionId, event_index: u64) {
        let changed = match self.sessions.lookup_mut(session_id) {
            Some(session) => session.clear_events(event_index),
            None => false,
        };
        if changed {
            if let Err(err) = self.update_last_completed().await {
                tracing::error!(error=%err, "error completing acknowledged events");
            }
            self.report_metrics();
        }
    }

    /// Publish the freshly committed event batches of one applied entry,
    /// chaining each onto its session's event queue.
    pub(self) async fn dispatch_events(&mut self, index: u64, events: Vec<ScopeEvents>) {
        for scope_events in events {
            let session_id = scope_events.session_id;
            let request = match self.sessions.lookup_mut(session_id) {
                Some(session) if session.is_active() => {
                    let batch = session.enqueue_events(index, scope_events.events);
                    if session.pending_event_count() > self.config.max_pending_event_batches {
                        tracing::warn!(
                            session_id,
                            pending = session.pending_event_count(),
                            "session event queue over cap, marking suspicious"
                        );
                        session.suspect();
                    }
                    Some(batch.to_publish(session_id))
                }
                _ => {
                    tracing::warn!(session_id, index, "discarding events for unknown or inactive session");
                    None
                }
            };
            if let Some(request) = request {
                self.publish(request).await;
            }
        }
    }

    /// Send one event batch out through the transport. Failures are logged;
    /// delivery is reconciled through keep-alive acknowledgements.
    pub(self) async fn publish(&self, request: PublishRequest) {
        tracing::debug!(request=%request.summary(), "publishing events");
        if let Err(err) = self.transport.publish(request).await {
            tracing::error!(error=%err, "error publishing events to transport");
        }
    }

    /// Advance the deterministic clock with a leader supplied timestamp.
    pub(self) fn advance_time(&mut self, timestamp: u64) -> u64 {
        self.time = self.time.max(timestamp);
        self.time
    }

    /// Mark overdue sessions suspicious. Never removes a session: compaction
    /// can elide keep-alive entries, so only a leader committed UNREGISTER
    /// may end one.
    pub(self) fn suspect_sessions(&mut self, exclude: SessionId, time: u64) {
        for session in self.sessions.iter_mut() {
            if session.id == exclude {
                continue;
            }
            if time.saturating_sub(session.timestamp) > session.timeout {
                session.suspect();
            }
        }
    }

    /// Build the read-only session roster shared with the application task.
    pub(self) fn build_roster(&self) -> SessionRoster {
        let mut roster = BTreeMap::new();
        for session in self.sessions.iter() {
            roster.insert(session.id, session.info());
        }
        Arc::new(roster)
    }

    /// Enqueue a task onto the application task.
    pub(self) fn send_machine(&mut self, task: MachineTask<D, R>) -> EngineResult<()> {
        self.tx_machine
            .send((task, tracing::debug_span!("CH")))
            .map_err(|_| self.fail_fatal(EngineError::Internal("the application task has stopped".into())))
    }

    /// Attach a retention hint to an entry the engine no longer needs.
    pub(self) async fn release_entry(&mut self, index: u64, mode: CompactionMode) {
        if let Err(err) = self.storage.release(index, mode).await {
            tracing::error!(error=%err, index, "error releasing entry for compaction");
        }
    }

    /// Report a metrics payload on the current state of the engine.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(EngineMetrics {
            cluster_name: self.config.cluster_name.clone(),
            state: self.state,
            last_applied: self.last_applied,
            last_completed: self.last_completed,
            snapshot_index: self.snapshot_index,
            sessions: self.sessions.len() as u64,
        });
        if let Err(err) = res {
            tracing::error!(error=%err, "error reporting metrics");
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable storage error.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> EngineError {
        tracing::error!({error=?err}, "fatal storage error, shutting down");
        self.state = EngineState::Shutdown;
        EngineError::Storage(err)
    }

    /// Trigger the shutdown sequence due to a structural engine error.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(self) fn fail_fatal(&mut self, err: EngineError) -> EngineError {
        tracing::error!(error=%err, "fatal engine error, shutting down");
        self.state = EngineState::Shutdown;
        err
    }
}
