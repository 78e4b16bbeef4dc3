//! The engine storage interface and data types.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use bytes::BytesMut;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncSeek;
use tokio::io::AsyncWrite;

use crate::entry::CompactionMode;
use crate::entry::Entry;
use crate::AppData;

/// Metadata describing a snapshot held by the snapshot store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotMeta {
    /// The entry index whose applied state the snapshot represents. Entries
    /// at or below it are eligible for compaction once the snapshot is
    /// finalized.
    pub index: u64,
    /// The term of the entry at `index`.
    pub term: u64,
    /// To identify a snapshot when transferring.
    pub snapshot_id: String,
}

/// A trait defining the storage surface consumed by the engine.
///
/// This combines the three external collaborators the engine reads and
/// nudges: the committed log, its compactor, and the snapshot store. The
/// engine never writes log entries — it assumes entries have already been
/// committed by consensus — and it does not implement durability of its own.
#[async_trait]
pub trait EngineStorage<D>: Send + Sync + 'static
where D: AppData
{
    /// The storage engine's associated type used for exposing a snapshot for
    /// reading & writing.
    type SnapshotData: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin + 'static;

    /// Read the committed entry at `index`.
    ///
    /// Returns `None` when the entry has been removed by compaction without a
    /// tombstone left in place. An implementation may instead return an entry
    /// whose payload is `EntryPayload::Tombstone`; the dispatcher treats both
    /// the same way.
    ///
    /// Errors returned from this method will cause the engine to go into
    /// shutdown.
    async fn entry(&self, index: u64) -> Result<Option<Entry<D>>>;

    /// The index of the last committed entry in the log.
    async fn last_index(&self) -> Result<u64>;

    /// Whether the log is open. A closed log fails all pending and new engine
    /// operations with `LogClosed`.
    fn is_open(&self) -> bool;

    /// Attach a retention hint to the entry at `index`: the engine no longer
    /// needs it once the given mode's retention condition is met.
    async fn release(&self, index: u64, mode: CompactionMode) -> Result<()>;

    /// The index up to which the physical compactor has advanced.
    async fn compact_index(&self) -> Result<u64>;

    /// The index of the snapshot the compactor may compact up to.
    async fn snapshot_index(&self) -> Result<u64>;

    /// Advance the compactor's snapshot index.
    async fn set_snapshot_index(&self, index: u64) -> Result<()>;

    /// Advance the compactor's minor index: entries at or below it whose
    /// events every session has acknowledged are eligible for minor
    /// compaction passes.
    async fn set_minor_index(&self, index: u64) -> Result<()>;

    /// Trigger a compaction pass.
    async fn compact(&self) -> Result<()>;

    /// Get the metadata of the current finalized snapshot, if one exists.
    async fn current_snapshot(&self) -> Result<Option<SnapshotMeta>>;

    /// Create a new pending snapshot at `index`, returning a writable handle.
    ///
    /// The snapshot is not visible through `current_snapshot` until
    /// `complete_snapshot` is called for it.
    async fn create_snapshot(&self, index: u64) -> Result<Box<Self::SnapshotData>>;

    /// Open a readable handle onto the snapshot at `index`.
    async fn open_snapshot(&self, index: u64) -> Result<Box<Self::SnapshotData>>;

    /// Finalize the pending snapshot at `index`, making it the current one.
    async fn complete_snapshot(&self, index: u64) -> Result<()>;

    /// Discard the pending snapshot at `index`.
    async fn discard_snapshot(&self, index: u64) -> Result<()>;
}

/// A byte sink handed to `StateMachine::snapshot`.
///
/// State machine calls are synchronous on the application task, so the
/// machine serializes into this buffer; the engine then streams the buffer
/// into the snapshot store's `SnapshotData` handle.
#[derive(Debug, Default)]
pub struct SnapshotWriter {
    buf: BytesMut,
}

impl SnapshotWriter {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Append bytes to the snapshot.
    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// The bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// A byte source handed to `StateMachine::install`.
#[derive(Debug)]
pub struct SnapshotReader {
    buf: Bytes,
}

impl SnapshotReader {
    /// Wrap raw snapshot contents for installation.
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// The full snapshot contents.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
