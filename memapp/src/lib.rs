//! An in-memory implementation of the `state-engine` storage, transport and
//! state machine traits, used for demos and testing.


use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::task::Context;
use std::task::Poll;

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use state_engine::entry::CompactionMode;
use state_engine::entry::Entry;
use state_engine::machine::Commit;
use state_engine::machine::EventTransport;
use state_engine::machine::PublishRequest;
use state_engine::machine::StateMachine;
use state_engine::storage::EngineStorage;
use state_engine::storage::SnapshotMeta;
use state_engine::storage::SnapshotReader;
use state_engine::storage::SnapshotWriter;
use state_engine::AppData;
use state_engine::AppDataResponse;
use state_engine::ApplyContext;
use tokio::io::AsyncRead;
use tokio::io::AsyncSeek;
use tokio::io::AsyncWrite;
use tokio::io::ReadBuf;
use tokio::sync::RwLock;

/// The application data request type for `MemApp`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ClientRequest {
    /// Echo the text back with an `-ok` suffix.
    Echo { text: String },
    /// Store a key, returning the previous value.
    Put { key: String, value: String },
    /// Read a key. Used as the query payload in tests.
    Get { key: String },
    /// Publish events to a session; `None` targets the submitting session.
    Publish {
        session: Option<u64>,
        events: Vec<String>,
    },
    /// Fail deterministically with the given message.
    Fail { message: String },
}

impl AppData for ClientRequest {}

/// The application data response type for `MemApp`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse(pub Option<String>);

impl AppDataResponse for ClientResponse {}

/// A simple in-memory state machine: a string key/value store with echo,
/// publish and deterministic-failure operations for exercising the engine.
#[derive(Default)]
pub struct MemApp {
    data: BTreeMap<String, String>,
}

impl MemApp {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachine<ClientRequest, ClientResponse> for MemApp {
    fn apply(&mut self, ctx: &mut ApplyContext<Self>, commit: Commit<ClientRequest>) -> Result<ClientResponse> {
        match commit.operation {
            ClientRequest::Echo { text } => Ok(ClientResponse(Some(format!("{}-ok", text)))),
            ClientRequest::Put { key, value } => Ok(ClientResponse(self.data.insert(key, value))),
            ClientRequest::Get { key } => Ok(ClientResponse(self.data.get(&key).cloned())),
            ClientRequest::Publish { session, events } => {
                let target = session.unwrap_or(commit.session);
                for event in events {
                    ctx.publish(target, Bytes::from(event));
                }
                Ok(ClientResponse(None))
            }
            ClientRequest::Fail { message } => Err(anyhow!(message)),
        }
    }

    fn supports_snapshot(&self) -> bool {
        true
    }

    fn snapshot(&mut self, writer: &mut SnapshotWriter) -> Result<()> {
        let data = serde_json::to_vec(&self.data)?;
        writer.write(&data);
        Ok(())
    }

    fn install(&mut self, reader: &mut SnapshotReader) -> Result<()> {
        self.data = serde_json::from_slice(reader.bytes())?;
        Ok(())
    }
}

/// An error from the in-memory storage.
#[derive(Debug, thiserror::Error)]
pub enum MemStorageError {
    #[error("no snapshot exists at index {0}")]
    MissingSnapshot(u64),
}

struct MemSnapshot {
    meta: SnapshotMeta,
    data: Vec<u8>,
    complete: bool,
}

type SnapshotSlots = Arc<Mutex<BTreeMap<u64, MemSnapshot>>>;

/// An in-memory implementation of the `EngineStorage` trait: a committed log
/// keyed by index, retention hints, a compactor fake and a snapshot store.
pub struct MemStorage {
    log: RwLock<BTreeMap<u64, Entry<ClientRequest>>>,
    released: Mutex<HashMap<u64, CompactionMode>>,
    open: AtomicBool,
    compact_index: AtomicU64,
    snapshot_index: AtomicU64,
    minor_index: AtomicU64,
    compaction_runs: AtomicU64,
    snapshot_seq: AtomicU64,
    snapshots: SnapshotSlots,
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStorage {
    /// Create a new, empty, open storage instance.
    pub fn new() -> Self {
        Self {
            log: RwLock::new(BTreeMap::new()),
            released: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
            compact_index: AtomicU64::new(0),
            snapshot_index: AtomicU64::new(0),
            minor_index: AtomicU64::new(0),
            compaction_runs: AtomicU64::new(0),
            snapshot_seq: AtomicU64::new(0),
            snapshots: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Append a committed entry to the log.
    pub async fn append(&self, entry: Entry<ClientRequest>) {
        self.log.write().await.insert(entry.index, entry);
    }

    /// Remove the entry at `index`, simulating compaction of the position.
    pub async fn purge(&self, index: u64) {
        self.log.write().await.remove(&index);
    }

    /// Store an entry at a position other than the one it carries, corrupting
    /// the log for dispatcher error tests.
    pub async fn append_at(&self, index: u64, entry: Entry<ClientRequest>) {
        self.log.write().await.insert(index, entry);
    }

    /// Close the log. All pending and new engine operations fail.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Move the fake physical compactor forward.
    pub fn set_compact_index(&self, index: u64) {
        self.compact_index.store(index, Ordering::SeqCst);
    }

    /// The retention mode the engine attached to `index`, if any.
    pub fn released_mode(&self, index: u64) -> Option<CompactionMode> {
        self.released.lock().unwrap().get(&index).copied()
    }

    /// The number of compaction passes the engine has triggered.
    pub fn compaction_runs(&self) -> u64 {
        self.compaction_runs.load(Ordering::SeqCst)
    }

    /// The minor compaction frontier the engine has advanced to.
    pub fn minor_index(&self) -> u64 {
        self.minor_index.load(Ordering::SeqCst)
    }

    /// Place a finalized snapshot directly into the store, as a leader
    /// driven snapshot installation would.
    pub fn inject_snapshot(&self, meta: SnapshotMeta, data: Vec<u8>) {
        let mut slots = self.snapshots.lock().unwrap();
        slots.insert(
            meta.index,
            MemSnapshot {
                meta,
                data,
                complete: true,
            },
        );
    }

    /// The raw bytes of the snapshot at `index`, if present.
    pub fn snapshot_data(&self, index: u64) -> Option<Vec<u8>> {
        self.snapshots.lock().unwrap().get(&index).map(|s| s.data.clone())
    }
}

#[async_trait]
impl EngineStorage<ClientRequest> for MemStorage {
    type SnapshotData = MemSnapshotHandle;

    async fn entry(&self, index: u64) -> Result<Option<Entry<ClientRequest>>> {
        Ok(self.log.read().await.get(&index).cloned())
    }

    async fn last_index(&self) -> Result<u64> {
        Ok(self.log.read().await.keys().next_back().copied().unwrap_or(0))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn release(&self, index: u64, mode: CompactionMode) -> Result<()> {
        self.released.lock().unwrap().insert(index, mode);
        Ok(())
    }

    async fn compact_index(&self) -> Result<u64> {
        Ok(self.compact_index.load(Ordering::SeqCst))
    }

    async fn snapshot_index(&self) -> Result<u64> {
        Ok(self.snapshot_index.load(Ordering::SeqCst))
    }

    async fn set_snapshot_index(&self, index: u64) -> Result<()> {
        self.snapshot_index.store(index, Ordering::SeqCst);
        Ok(())
    }

    async fn set_minor_index(&self, index: u64) -> Result<()> {
        self.minor_index.store(index, Ordering::SeqCst);
        Ok(())
    }

    async fn compact(&self) -> Result<()> {
        // Remove released entries a finalized snapshot covers; positions the
        // engine still holds a live reference to carry no hint and survive.
        let through = self.snapshot_index.load(Ordering::SeqCst);
        let mut log = self.log.write().await;
        let covered: Vec<u64> = log.range(..=through).map(|(index, _)| *index).collect();
        let released = self.released.lock().unwrap();
        for index in covered {
            if released.contains_key(&index) {
                log.remove(&index);
            }
        }
        self.compaction_runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn current_snapshot(&self) -> Result<Option<SnapshotMeta>> {
        let slots = self.snapshots.lock().unwrap();
        Ok(slots.values().rev().find(|s| s.complete).map(|s| s.meta.clone()))
    }

    async fn create_snapshot(&self, index: u64) -> Result<Box<Self::SnapshotData>> {
        let term = self.log.read().await.get(&index).map(|e| e.term).unwrap_or(0);
        let snapshot_id = format!("snapshot-{}", self.snapshot_seq.fetch_add(1, Ordering::SeqCst));
        let meta = SnapshotMeta {
            index,
            term,
            snapshot_id,
        };
        Ok(Box::new(MemSnapshotHandle::writer(meta, self.snapshots.clone())))
    }

    async fn open_snapshot(&self, index: u64) -> Result<Box<Self::SnapshotData>> {
        let slots = self.snapshots.lock().unwrap();
        let snapshot = slots.get(&index).ok_or(MemStorageError::MissingSnapshot(index))?;
        Ok(Box::new(MemSnapshotHandle::reader(snapshot.data.clone())))
    }

    async fn complete_snapshot(&self, index: u64) -> Result<()> {
        let mut slots = self.snapshots.lock().unwrap();
        let snapshot = slots.get_mut(&index).ok_or(MemStorageError::MissingSnapshot(index))?;
        snapshot.complete = true;
        Ok(())
    }

    async fn discard_snapshot(&self, index: u64) -> Result<()> {
        self.snapshots.lock().unwrap().remove(&index);
        Ok(())
    }
}

/// A snapshot read/write handle backed by an in-memory buffer.
///
/// Writers buffer until shutdown, at which point the bytes land in the
/// store's slot for the snapshot's index; readers are preloaded.
pub struct MemSnapshotHandle {
    cursor: Cursor<Vec<u8>>,
    /// Present on writers: where the bytes are committed on shutdown.
    slot: Option<(SnapshotMeta, SnapshotSlots)>,
}

impl MemSnapshotHandle {
    fn writer(meta: SnapshotMeta, slots: SnapshotSlots) -> Self {
        Self {
            cursor: Cursor::new(Vec::new()),
            slot: Some((meta, slots)),
        }
    }

    fn reader(data: Vec<u8>) -> Self {
        Self {
            cursor: Cursor::new(data),
            slot: None,
        }
    }
}

impl AsyncRead for MemSnapshotHandle {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.cursor).poll_read(cx, buf)
    }
}

impl AsyncSeek for MemSnapshotHandle {
    fn start_seek(mut self: Pin<&mut Self>, position: std::io::SeekFrom) -> std::io::Result<()> {
        Pin::new(&mut self.cursor).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Pin::new(&mut self.cursor).poll_complete(cx)
    }
}

impl AsyncWrite for MemSnapshotHandle {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.cursor).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.cursor).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if let Some((meta, slots)) = self.slot.take() {
            let data = std::mem::take(self.cursor.get_mut());
            let mut slots = slots.lock().unwrap();
            slots.insert(
                meta.index,
                MemSnapshot {
                    meta,
                    data,
                    complete: false,
                },
            );
        }
        Pin::new(&mut self.cursor).poll_shutdown(cx)
    }
}

/// An event transport which records every publish for inspection.
#[derive(Default)]
pub struct MemTransport {
    requests: Mutex<Vec<PublishRequest>>,
}

impl MemTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every publish observed so far, in order.
    pub fn requests(&self) -> Vec<PublishRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Drain the observed publishes.
    pub fn take_requests(&self) -> Vec<PublishRequest> {
        std::mem::take(&mut *self.requests.lock().unwrap())
    }
}

#[async_trait]
impl EventTransport for MemTransport {
    async fn publish(&self, request: PublishRequest) -> Result<()> {
        tracing::debug!(session_id = request.session_id, event_index = request.event_index, "publish");
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}
