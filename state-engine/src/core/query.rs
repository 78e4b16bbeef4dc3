//! Read-only query admission and execution.
//!
//! Queries do not traverse the log and never produce events. A query tagged
//! with `min_index` is admitted only once `last_applied` has reached that
//! barrier; it then executes within a query scope at the engine's current
//! applied index, not at any nominal index of its own.

use tokio::sync::oneshot;

use crate::core::machine_task::MachineTask;
use crate::core::EngineCore;
use crate::engine::Outcome;
use crate::engine::QueryRequest;
use crate::engine::QueryTx;
use crate::error::EngineError;
use crate::machine::EventTransport;
use crate::session::WaitingQuery;
use crate::storage::EngineStorage;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::SessionId;

impl<D, R, S, T> EngineCore<D, R, S, T>
where
    D: AppData,
    R: AppDataResponse,
    S: EngineStorage<D>,
    T: EventTransport,
{
    /// Fail every parked query; the log has closed underneath them.
    pub(super) fn fail_waiting_queries(&mut self) {
        for id in self.sessions.ids() {
            if let Some(session) = self.sessions.lookup_mut(id) {
                for query in session.take_all_queries() {
                    let _ = query.tx.send(Err(EngineError::LogClosed));
                }
            }
        }
    }

    /// Admit a query: execute it now if its barrier is satisfied, otherwise
    /// park it on its session until `last_applied` catches up.
    #[tracing::instrument(level="debug", skip(self, rpc, tx), fields(rpc=%rpc.summary()))]
    pub(super) async fn handle_query(&mut self, rpc: QueryRequest<D>, tx: QueryTx<R>) {
        if !self.storage.is_open() {
            self.fail_waiting_queries();
            let _ = tx.send(Err(EngineError::LogClosed));
            return;
        }
        let active = self.sessions.lookup(rpc.session_id).map(|s| s.is_active()).unwrap_or(false);
        if !active {
            let _ = tx.send(Err(EngineError::UnknownSession(rpc.session_id)));
            return;
        }

        if self.last_applied >= rpc.min_index {
            self.execute_query(rpc.session_id, rpc.sequence, rpc.data, tx).await;
        } else {
            tracing::debug!(
                session_id = rpc.session_id,
                sequence = rpc.sequence,
                min_index = rpc.min_index,
                last_applied = self.last_applied,
                "parking query until its barrier is applied"
            );
            if let Some(session) = self.sessions.lookup_mut(rpc.session_id) {
                session.park_query(
                    rpc.min_index,
                    WaitingQuery {
                        sequence: rpc.sequence,
                        data: rpc.data,
                        tx,
                    },
                );
            }
        }
    }

    /// Execute a query at the engine's current applied index.
    pub(super) async fn execute_query(&mut self, session_id: SessionId, sequence: u64, data: D, tx: QueryTx<R>) {
        let active = self.sessions.lookup(session_id).map(|s| s.is_active()).unwrap_or(false);
        if !active {
            let _ = tx.send(Err(EngineError::UnknownSession(session_id)));
            return;
        }

        let index = self.last_applied;
        tracing::debug!(session_id, sequence, index, "executing query");
        let (machine_tx, machine_rx) = oneshot::channel();
        let sent = self.send_machine(MachineTask::Query {
            index,
            session_id,
            data,
            tx: machine_tx,
        });
        if sent.is_err() {
            let _ = tx.send(Err(EngineError::ShuttingDown));
            return;
        }

        match machine_rx.await {
            Ok(result) => {
                let event_index = self.sessions.lookup(session_id).map(|s| s.event_index).unwrap_or(0);
                let _ = tx.send(Ok(Outcome {
                    index,
                    event_index,
                    result,
                }));
            }
            Err(_) => {
                let _ = tx.send(Err(EngineError::ShuttingDown));
            }
        }
    }
}
