//! Snapshot coordination: take, install, and complete.
//!
//! A snapshot at index `i` is written eagerly but finalized lazily: it only
//! becomes the current snapshot once `last_completed >= i`, because a
//! snapshot must not be exposed while any session still has unacknowledged
//! events at or below its index — replay from such a snapshot would lose
//! those events.

use bytes::Bytes;
use futures::future::AbortHandle;
use futures::future::Abortable;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing_futures::Instrument;

use crate::config::SnapshotPolicy;
use crate::core::machine_task::MachineTask;
use crate::core::EngineCore;
use crate::error::EngineError;
use crate::error::EngineResult;
use crate::machine::EventTransport;
use crate::storage::EngineStorage;
use crate::storage::SnapshotMeta;
use crate::AppData;
use crate::AppDataResponse;

/// The engine's at-most-one snapshot written but not yet finalized.
pub(super) struct PendingSnapshot {
    /// The applied index the snapshot covers.
    pub index: u64,
    /// Whether the background write-out has finished.
    pub persisted: bool,
    /// A handle to abort the write-out if a newer snapshot is installed.
    pub abort_handle: AbortHandle,
}

/// An update on a background snapshot write-out.
#[derive(Debug)]
pub(super) enum SnapshotUpdate {
    /// The snapshot covering the given index has been persisted.
    Persisted(u64),
    /// The write-out failed or was aborted.
    Failed(u64),
}

impl<D, R, S, T> EngineCore<D, R, S, T>
where
    D: AppData,
    R: AppDataResponse,
    S: EngineStorage<D>,
    T: EventTransport,
{
    /// Take a snapshot of the state machine if the policy and safety
    /// conditions allow. Called from `set_last_applied`.
    pub(super) async fn maybe_take_snapshot(&mut self) -> EngineResult<()> {
        if self.pending_snapshot.is_some() || !self.snapshottable {
            return Ok(());
        }
        let SnapshotPolicy::LogsSinceLast(threshold) = &self.config.snapshot_policy;
        if self.last_applied < self.snapshot_index.saturating_add(*threshold) {
            return Ok(());
        }

        let current = self.storage.current_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?;
        let clear = match &current {
            None => true,
            Some(meta) => {
                let compact_index =
                    self.storage.compact_index().await.map_err(|err| self.map_fatal_storage_error(err))?;
                compact_index > meta.index && self.last_applied > meta.index
            }
        };
        if !clear {
            return Ok(());
        }

        let index = self.last_applied;
        tracing::info!(index, "taking snapshot");

        // Serialize the machine synchronously on the application task; the
        // bytes are persisted in the background below.
        let (tx, rx) = oneshot::channel();
        self.send_machine(MachineTask::Snapshot { index, tx })?;
        let data = match self.await_machine(rx).await? {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(error=%err, index, "state machine failed to serialize a snapshot");
                return Ok(());
            }
        };

        let snapshot = self.storage.create_snapshot(index).await.map_err(|err| self.map_fatal_storage_error(err))?;

        let (abort_handle, reg) = AbortHandle::new_pair();
        self.pending_snapshot = Some(PendingSnapshot {
            index,
            persisted: false,
            abort_handle,
        });
        let tx_snapshot = self.tx_snapshot.clone();
        tokio::spawn(
            async move {
                let write = write_snapshot(snapshot, data);
                match Abortable::new(write, reg).await {
                    Ok(Ok(())) => {
                        let _ = tx_snapshot.try_send(SnapshotUpdate::Persisted(index));
                    }
                    Ok(Err(err)) => {
                        tracing::error!(error=%err, index, "error persisting snapshot");
                        let _ = tx_snapshot.try_send(SnapshotUpdate::Failed(index));
                    }
                    Err(_aborted) => {
                        let _ = tx_snapshot.try_send(SnapshotUpdate::Failed(index));
                    }
                }
            }
            .instrument(tracing::debug_span!("snapshot-writer")),
        );
        Ok(())
    }

    /// Handle the result of a background snapshot write-out.
    pub(super) async fn handle_snapshot_update(&mut self, update: SnapshotUpdate) {
        tracing::debug!(?update, "snapshot update");
        match update {
            SnapshotUpdate::Persisted(index) => {
                let matches = self.pending_snapshot.as_ref().map(|p| p.index == index).unwrap_or(false);
                if matches {
                    if let Some(pending) = self.pending_snapshot.as_mut() {
                        pending.persisted = true;
                    }
                    if let Err(err) = self.maybe_complete_snapshot().await {
                        tracing::error!(error=%err, "error completing snapshot");
                    }
                }
            }
            SnapshotUpdate::Failed(index) => {
                let matches = self.pending_snapshot.as_ref().map(|p| p.index == index).unwrap_or(false);
                if matches {
                    self.pending_snapshot = None;
                }
            }
        }
    }

    /// Finalize the pending snapshot once every session has acknowledged the
    /// events at or below its index. Called from `update_last_completed`.
    pub(super) async fn maybe_complete_snapshot(&mut self) -> EngineResult<()> {
        let (index, persisted) = match &self.pending_snapshot {
            Some(pending) => (pending.index, pending.persisted),
            None => return Ok(()),
        };
        if !persisted || self.last_completed < index {
            return Ok(());
        }

        let current = self.storage.current_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))?;
        match current {
            Some(meta) if meta.index >= index => {
                // A newer snapshot became current while this one was pending.
                tracing::debug!(index, current = meta.index, "discarding superseded pending snapshot");
                self.storage.discard_snapshot(index).await.map_err(|err| self.map_fatal_storage_error(err))?;
            }
            _ => {
                self.storage.complete_snapshot(index).await.map_err(|err| self.map_fatal_storage_error(err))?;
                self.snapshot_index = index;
                self.storage.set_snapshot_index(index).await.map_err(|err| self.map_fatal_storage_error(err))?;
                self.storage.compact().await.map_err(|err| self.map_fatal_storage_error(err))?;
                tracing::info!(index, "snapshot finalized");
            }
        }
        self.pending_snapshot = None;
        self.report_metrics();
        Ok(())
    }

    /// Install an externally persisted snapshot once the applied state has
    /// caught up with it exactly. Called from `set_last_applied`.
    ///
    /// Strict index equality is required so the state machine observes a
    /// consistent prefix.
    pub(super) async fn maybe_install_snapshot(&mut self) -> EngineResult<()> {
        let meta = match self.storage.current_snapshot().await.map_err(|err| self.map_fatal_storage_error(err))? {
            Some(meta) => meta,
            None => return Ok(()),
        };
        let snapshot_index = self.storage.snapshot_index().await.map_err(|err| self.map_fatal_storage_error(err))?;
        if meta.index <= snapshot_index || meta.index != self.last_applied {
            return Ok(());
        }
        self.install_snapshot(&meta).await
    }

    /// Load a snapshot's bytes and replace the state machine's state.
    pub(super) async fn install_snapshot(&mut self, meta: &SnapshotMeta) -> EngineResult<()> {
        tracing::info!(index = meta.index, "installing snapshot");

        // A locally written snapshot still in flight is superseded.
        if let Some(pending) = self.pending_snapshot.take() {
            pending.abort_handle.abort();
        }

        let mut reader = self.storage.open_snapshot(meta.index).await.map_err(|err| self.map_fatal_storage_error(err))?;
        let mut data = Vec::new();
        reader
            .as_mut()
            .read_to_end(&mut data)
            .await
            .map_err(|err| self.map_fatal_storage_error(err.into()))?;

        let (tx, rx) = oneshot::channel();
        self.send_machine(MachineTask::Install {
            index: meta.index,
            data: Bytes::from(data),
            tx,
        })?;
        match self.await_machine(rx).await? {
            Ok(()) => {}
            Err(err) => {
                return Err(self.fail_fatal(EngineError::Internal(format!(
                    "state machine failed to install snapshot at {}: {:#}",
                    meta.index, err
                ))))
            }
        }

        self.snapshot_index = meta.index;
        self.storage.set_snapshot_index(meta.index).await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.report_metrics();
        Ok(())
    }
}

/// Stream serialized state machine bytes into a snapshot handle.
async fn write_snapshot<SD>(mut snapshot: Box<SD>, data: Bytes) -> anyhow::Result<()>
where SD: AsyncWrite + Send + Unpin + 'static {
    snapshot.as_mut().write_all(&data).await?;
    snapshot.as_mut().shutdown().await?;
    Ok(())
}
