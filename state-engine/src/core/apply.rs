//! Typed entry handlers: session lifecycle and linearizable commands.

use tokio::sync::oneshot;

use crate::context::ScopeEvents;
use crate::core::machine_task::MachineTask;
use crate::core::EngineCore;
use crate::engine::ApplyResponse;
use crate::engine::AppliedData;
use crate::engine::Outcome;
use crate::entry::CommandEntry;
use crate::entry::CompactionMode;
use crate::entry::ConnectEntry;
use crate::entry::KeepAliveEntry;
use crate::entry::RegisterEntry;
use crate::entry::UnregisterEntry;
use crate::error::EngineError;
use crate::error::EngineResult;
use crate::machine::EventTransport;
use crate::session::Session;
use crate::storage::EngineStorage;
use crate::AppData;
use crate::AppDataResponse;

impl<D, R, S, T> EngineCore<D, R, S, T>
where
    D: AppData,
    R: AppDataResponse,
    S: EngineStorage<D>,
    T: EventTransport,
{
    /// Apply a REGISTER entry: create and open a session whose id is the
    /// entry's index.
    #[tracing::instrument(level = "debug", skip(self, register))]
    pub(super) async fn apply_register(
        &mut self,
        index: u64,
        timestamp: u64,
        register: RegisterEntry,
    ) -> EngineResult<ApplyResponse<R>> {
        let time = self.advance_time(timestamp);
        let timeout = self.config.clamp_session_timeout(register.timeout);
        let session = Session::new(index, register.client_id, timeout, time);
        let info = session.info();
        self.sessions.register(session);
        self.suspect_sessions(0, time);

        let roster = self.build_roster();
        let (tx, rx) = oneshot::channel();
        self.send_machine(MachineTask::SessionOpened {
            index,
            time,
            info,
            roster,
            tx,
        })?;
        let events = self.await_machine(rx).await?;

        if let Some(session) = self.sessions.lookup_mut(index) {
            session.open();
        }
        tracing::info!(session_id = index, "session registered");
        self.dispatch_events(index, events).await;
        self.set_last_applied(index).await?;
        Ok(ApplyResponse {
            index,
            data: AppliedData::Session(index),
        })
    }

    /// Apply a KEEP_ALIVE entry: refresh liveness, prune the response cache,
    /// and resend unacknowledged events.
    #[tracing::instrument(level = "debug", skip(self, keep_alive))]
    pub(super) async fn apply_keep_alive(
        &mut self,
        index: u64,
        timestamp: u64,
        keep_alive: KeepAliveEntry,
    ) -> EngineResult<ApplyResponse<R>> {
        let time = self.advance_time(timestamp);
        self.suspect_sessions(keep_alive.session_id, time);

        let active = self.sessions.lookup(keep_alive.session_id).map(|s| s.is_active()).unwrap_or(false);
        if !active {
            self.release_entry(index, CompactionMode::Quorum).await;
            self.set_last_applied(index).await?;
            return Err(EngineError::UnknownSession(keep_alive.session_id));
        }

        // Run scheduled callbacks under an (empty) command scope at this
        // entry's index before mutating the session.
        let events = self.machine_tick(index, time).await?;

        let (released_results, superseded, resend) = {
            let session = match self.sessions.lookup_mut(keep_alive.session_id) {
                Some(session) => session,
                None => {
                    return Err(self.fail_fatal(EngineError::Internal(format!(
                        "session {} vanished during keep-alive",
                        keep_alive.session_id
                    ))))
                }
            };
            session.trust();
            session.timestamp = time;
            let released = session.clear_results(keep_alive.command_sequence);
            session.clear_events(keep_alive.event_index);
            session.request_sequence = session.request_sequence.max(keep_alive.command_sequence);
            let resend: Vec<_> =
                session.pending_events().map(|batch| batch.to_publish(keep_alive.session_id)).collect();
            let superseded = session.set_keep_alive_entry(index);
            (released, superseded, resend)
        };

        for released in released_results {
            self.release_entry(released, CompactionMode::Sequential).await;
        }
        if let Some(previous) = superseded {
            self.release_entry(previous, CompactionMode::Sequential).await;
        }
        for request in resend {
            self.publish(request).await;
        }

        self.dispatch_events(index, events).await;
        self.set_last_applied(index).await?;
        Ok(ApplyResponse {
            index,
            data: AppliedData::None,
        })
    }

    /// Apply an UNREGISTER entry: the only transition that may end a session.
    #[tracing::instrument(level = "debug", skip(self, unregister))]
    pub(super) async fn apply_unregister(
        &mut self,
        index: u64,
        timestamp: u64,
        unregister: UnregisterEntry,
    ) -> EngineResult<ApplyResponse<R>> {
        let time = self.advance_time(timestamp);
        self.suspect_sessions(unregister.session_id, time);

        let active = self.sessions.lookup(unregister.session_id).map(|s| s.is_active()).unwrap_or(false);
        if !active {
            self.release_entry(index, CompactionMode::Quorum).await;
            self.set_last_applied(index).await?;
            return Err(EngineError::UnknownSession(unregister.session_id));
        }

        let mut session = match self.sessions.remove(unregister.session_id) {
            Some(session) => session,
            None => {
                return Err(self.fail_fatal(EngineError::Internal(format!(
                    "session {} vanished during unregister",
                    unregister.session_id
                ))))
            }
        };

        let roster = self.build_roster();
        let info = session.info();
        let (tx, rx) = oneshot::channel();
        self.send_machine(MachineTask::SessionClosed {
            index,
            time,
            info,
            expired: unregister.expired,
            roster,
            tx,
        })?;
        let events = self.await_machine(rx).await?;

        if unregister.expired {
            session.expire();
            tracing::info!(session_id = session.id, "session expired");
        } else {
            tracing::info!(session_id = session.id, "session unregistered");
        }
        session.close();

        for query in session.take_all_queries() {
            let _ = query.tx.send(Err(EngineError::UnknownSession(session.id)));
        }
        for held in session.held_entries() {
            self.release_entry(held, CompactionMode::Sequential).await;
        }
        self.release_entry(index, CompactionMode::Sequential).await;

        self.dispatch_events(index, events).await;
        self.set_last_applied(index).await?;
        Ok(ApplyResponse {
            index,
            data: AppliedData::None,
        })
    }

    /// Apply a CONNECT entry. Connections count as keep-alives; there is no
    /// user callback.
    #[tracing::instrument(level = "debug", skip(self, connect))]
    pub(super) async fn apply_connect(
        &mut self,
        index: u64,
        timestamp: u64,
        connect: ConnectEntry,
    ) -> EngineResult<ApplyResponse<R>> {
        let time = self.advance_time(timestamp);
        let superseded = match self.sessions.lookup_by_client_mut(&connect.client_id) {
            Some(session) => {
                session.trust();
                session.timestamp = time;
                Some(session.set_connect_entry(index))
            }
            None => None,
        };
        match superseded {
            Some(released) => {
                for previous in released {
                    self.release_entry(previous, CompactionMode::Sequential).await;
                }
            }
            None => {
                tracing::debug!(client_id = %connect.client_id, "connect for unknown client");
                self.release_entry(index, CompactionMode::Sequential).await;
            }
        }
        self.set_last_applied(index).await?;
        Ok(ApplyResponse {
            index,
            data: AppliedData::None,
        })
    }

    /// Apply an INITIALIZE entry committed by a new leader: bump every
    /// session's timestamp so leadership changes do not starve sessions.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn apply_initialize(&mut self, index: u64, timestamp: u64) -> EngineResult<ApplyResponse<R>> {
        let time = self.advance_time(timestamp);
        for session in self.sessions.iter_mut() {
            session.timestamp = time;
        }
        self.release_entry(index, CompactionMode::Sequential).await;
        self.set_last_applied(index).await?;
        Ok(ApplyResponse {
            index,
            data: AppliedData::None,
        })
    }

    /// Apply a CONFIGURATION entry. No state machine effect.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn apply_configuration(&mut self, index: u64) -> EngineResult<ApplyResponse<R>> {
        self.release_entry(index, CompactionMode::Sequential).await;
        self.set_last_applied(index).await?;
        Ok(ApplyResponse {
            index,
            data: AppliedData::None,
        })
    }

    /// Apply a COMMAND entry with linearizable semantics: retried sequences
    /// replay their cached outcome, fresh sequences run the state machine.
    #[tracing::instrument(level = "debug", skip(self, command))]
    pub(super) async fn apply_command(
        &mut self,
        index: u64,
        timestamp: u64,
        command: CommandEntry<D>,
    ) -> EngineResult<ApplyResponse<R>> {
        let time = self.advance_time(timestamp);

        let active = self.sessions.lookup(command.session_id).map(|s| s.is_active()).unwrap_or(false);
        if !active {
            // The command's session is gone; retain the entry only until a
            // quorum has seen it.
            self.release_entry(index, CompactionMode::Quorum).await;
            self.set_last_applied(index).await?;
            return Err(EngineError::UnknownSession(command.session_id));
        }

        // A sequence at or below the session's applied frontier is a retry:
        // the cached outcome is returned verbatim, never re-applied.
        if command.sequence > 0 {
            let replayed = self
                .sessions
                .lookup(command.session_id)
                .map(|s| command.sequence <= s.command_sequence)
                .unwrap_or(false);
            if replayed {
                let cached = self
                    .sessions
                    .lookup(command.session_id)
                    .and_then(|s| s.cached_result(command.sequence))
                    .cloned();
                return match cached {
                    Some(outcome) => {
                        tracing::debug!(
                            session_id = command.session_id,
                            sequence = command.sequence,
                            "returning cached outcome for retried command"
                        );
                        self.set_last_applied(index).await?;
                        Ok(ApplyResponse {
                            index,
                            data: AppliedData::Outcome(outcome),
                        })
                    }
                    None => Err(self.fail_fatal(EngineError::Internal(format!(
                        "missing cached outcome for replayed sequence {} of session {}",
                        command.sequence, command.session_id
                    )))),
                };
            }
        }

        let (tx, rx) = oneshot::channel();
        self.send_machine(MachineTask::Command {
            index,
            time,
            session_id: command.session_id,
            data: command.data,
            tx,
        })?;
        let effect = self.await_machine(rx).await?;

        self.dispatch_events(index, effect.events).await;

        let outcome = {
            let session = match self.sessions.lookup_mut(command.session_id) {
                Some(session) => session,
                None => {
                    return Err(self.fail_fatal(EngineError::Internal(format!(
                        "session {} vanished during command application",
                        command.session_id
                    ))))
                }
            };
            session.request_sequence = session.request_sequence.max(command.sequence);
            let outcome = Outcome {
                index,
                event_index: session.event_index,
                result: effect.result,
            };
            if command.sequence > 0 {
                session.cache_result(command.sequence, outcome.clone());
                session.command_sequence = command.sequence;
            }
            outcome
        };

        if command.sequence == 0 {
            // Uncached commands hold no retention obligation.
            self.release_entry(index, CompactionMode::Sequential).await;
        }

        self.set_last_applied(index).await?;
        Ok(ApplyResponse {
            index,
            data: AppliedData::Outcome(outcome),
        })
    }

    /// Run scheduled callbacks under an empty command scope at `index`.
    pub(super) async fn machine_tick(&mut self, index: u64, time: u64) -> EngineResult<Vec<ScopeEvents>> {
        let (tx, rx) = oneshot::channel();
        self.send_machine(MachineTask::Tick { index, time, tx })?;
        self.await_machine(rx).await
    }

    /// Await a reply from the application task, mapping its loss to a fatal
    /// engine fault.
    pub(super) async fn await_machine<V>(&mut self, rx: oneshot::Receiver<V>) -> EngineResult<V> {
        match rx.await {
            Ok(value) => Ok(value),
            Err(_) => Err(self.fail_fatal(EngineError::Internal("the application task dropped a reply".into()))),
        }
    }
}
