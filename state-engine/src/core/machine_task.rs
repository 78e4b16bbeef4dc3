//! The application task: the single thread of execution for every user state
//! machine and session listener call.
//!
//! The engine task prepares inputs and enqueues typed tasks here; this task
//! executes them against the state machine within an `init → user code →
//! commit` scope, then replies with the result and the per-session event
//! batches the scope produced. Scopes never nest, and suspension points
//! exist only at the mailbox, so user code observes a strictly serial,
//! deterministic execution.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::Span;
use tracing_futures::Instrument;

use crate::context::ApplyContext;
use crate::context::ScopeEvents;
use crate::context::ScopeKind;
use crate::context::SessionRoster;
use crate::error::UserError;
use crate::machine::Commit;
use crate::machine::SessionInfo;
use crate::machine::SessionListener;
use crate::machine::StateMachine;
use crate::storage::SnapshotReader;
use crate::storage::SnapshotWriter;
use crate::AppData;
use crate::AppDataResponse;
use crate::SessionId;

/// Facts the engine needs from the state machine at startup.
pub(crate) struct InitEffect {
    pub snapshottable: bool,
}

/// The reply to a command scope.
pub(crate) struct CommandEffect<R: AppDataResponse> {
    pub result: Result<R, UserError>,
    pub events: Vec<ScopeEvents>,
}

/// A unit of work for the application task.
pub(crate) enum MachineTask<D: AppData, R: AppDataResponse> {
    /// Initialize the state machine before any entry is applied.
    Init {
        roster: SessionRoster,
        tx: oneshot::Sender<InitEffect>,
    },
    /// Advance the deterministic clock and run an empty command scope, so
    /// scheduled callbacks fire for entries with no user apply of their own.
    Tick {
        index: u64,
        time: u64,
        tx: oneshot::Sender<Vec<ScopeEvents>>,
    },
    /// Apply a command within a command scope.
    Command {
        index: u64,
        time: u64,
        session_id: SessionId,
        data: D,
        tx: oneshot::Sender<CommandEffect<R>>,
    },
    /// Execute a read-only query within a query scope.
    Query {
        index: u64,
        session_id: SessionId,
        data: D,
        tx: oneshot::Sender<Result<R, UserError>>,
    },
    /// A session registered: run listeners within a command scope.
    SessionOpened {
        index: u64,
        time: u64,
        info: SessionInfo,
        roster: SessionRoster,
        tx: oneshot::Sender<Vec<ScopeEvents>>,
    },
    /// A session unregistered: run listeners within a command scope.
    SessionClosed {
        index: u64,
        time: u64,
        info: SessionInfo,
        expired: bool,
        roster: SessionRoster,
        tx: oneshot::Sender<Vec<ScopeEvents>>,
    },
    /// Serialize the machine's state for a snapshot at `index`.
    Snapshot {
        index: u64,
        tx: oneshot::Sender<anyhow::Result<Bytes>>,
    },
    /// Replace the machine's state from a snapshot at `index`.
    Install {
        index: u64,
        data: Bytes,
        tx: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// The task owning the user state machine and the session listeners.
pub(crate) struct MachineCore<D, R, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
{
    machine: M,
    context: ApplyContext<M>,
    listeners: Vec<Box<dyn SessionListener>>,
    rx: mpsc::UnboundedReceiver<(MachineTask<D, R>, Span)>,
}

impl<D, R, M> MachineCore<D, R, M>
where
    D: AppData,
    R: AppDataResponse,
    M: StateMachine<D, R>,
{
    pub(crate) fn spawn(
        machine: M,
        listeners: Vec<Box<dyn SessionListener>>,
        rx: mpsc::UnboundedReceiver<(MachineTask<D, R>, Span)>,
    ) -> JoinHandle<()> {
        let this = Self {
            machine,
            context: ApplyContext::new(),
            listeners,
            rx,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("machine")))
    }

    async fn main(mut self) {
        while let Some((task, span)) = self.rx.recv().await {
            let _ent = span.enter();
            self.handle(task);
        }
        tracing::debug!("application task stopping");
    }

    fn handle(&mut self, task: MachineTask<D, R>) {
        match task {
            MachineTask::Init { roster, tx } => {
                self.context.set_roster(roster);
                self.machine.init(&mut self.context);
                let _ = tx.send(InitEffect {
                    snapshottable: self.machine.supports_snapshot(),
                });
            }
            MachineTask::Tick { index, time, tx } => {
                self.context.tick(&mut self.machine, index, time);
                self.context.init(index, time, ScopeKind::Command);
                let _ = tx.send(self.context.commit());
            }
            MachineTask::Command {
                index,
                time,
                session_id,
                data,
                tx,
            } => {
                self.context.tick(&mut self.machine, index, time);
                self.context.init(index, time, ScopeKind::Command);
                let commit = Commit {
                    index,
                    time: self.context.time(),
                    session: session_id,
                    operation: data,
                };
                let result = self.machine.apply(&mut self.context, commit).map_err(|err| {
                    tracing::debug!(index, error=%err, "state machine returned an error for command");
                    UserError::from_anyhow(&err)
                });
                let events = self.context.commit();
                let _ = tx.send(CommandEffect { result, events });
            }
            MachineTask::Query {
                index,
                session_id,
                data,
                tx,
            } => {
                // Queries do not carry a leader timestamp and never advance
                // the clock; they observe the state as of `index`.
                self.context.init(index, self.context.time(), ScopeKind::Query);
                let commit = Commit {
                    index,
                    time: self.context.time(),
                    session: session_id,
                    operation: data,
                };
                let result = self.machine.apply(&mut self.context, commit).map_err(|err| UserError::from_anyhow(&err));
                let discarded = self.context.commit();
                debug_assert!(discarded.is_empty(), "query scopes must not produce events");
                let _ = tx.send(result);
            }
            MachineTask::SessionOpened {
                index,
                time,
                info,
                roster,
                tx,
            } => {
                self.context.set_roster(roster);
                self.context.tick(&mut self.machine, index, time);
                self.context.init(index, time, ScopeKind::Command);
                for listener in self.listeners.iter_mut() {
                    listener.register(&info);
                }
                let _ = tx.send(self.context.commit());
            }
            MachineTask::SessionClosed {
                index,
                time,
                info,
                expired,
                roster,
                tx,
            } => {
                self.context.set_roster(roster);
                self.context.tick(&mut self.machine, index, time);
                self.context.init(index, time, ScopeKind::Command);
                if expired {
                    for listener in self.listeners.iter_mut() {
                        listener.expire(&info);
                    }
                } else {
                    for listener in self.listeners.iter_mut() {
                        listener.unregister(&info);
                    }
                }
                for listener in self.listeners.iter_mut() {
                    listener.close(&info);
                }
                let _ = tx.send(self.context.commit());
            }
            MachineTask::Snapshot { index, tx } => {
                let mut writer = SnapshotWriter::new();
                let res = self.machine.snapshot(&mut writer).map(|()| {
                    let data = writer.into_bytes();
                    tracing::debug!(index, len = data.len(), "state machine serialized for snapshot");
                    data
                });
                let _ = tx.send(res);
            }
            MachineTask::Install { index, data, tx } => {
                let mut reader = SnapshotReader::new(data);
                tracing::debug!(index, len = reader.len(), "installing snapshot into state machine");
                let _ = tx.send(self.machine.install(&mut reader));
            }
        }
    }
}
