//! Fixtures for testing the state machine engine.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;

use memapp::ClientRequest;
use memapp::ClientResponse;
use memapp::MemApp;
use memapp::MemStorage;
use memapp::MemTransport;
use state_engine::entry::CommandEntry;
use state_engine::entry::ConnectEntry;
use state_engine::entry::Entry;
use state_engine::entry::EntryPayload;
use state_engine::entry::KeepAliveEntry;
use state_engine::entry::RegisterEntry;
use state_engine::entry::UnregisterEntry;
use state_engine::machine::SessionInfo;
use state_engine::machine::SessionListener;
use state_engine::ApplyResponse;
use state_engine::Config;
use state_engine::EngineResult;
use state_engine::StateEngine;
use tracing_subscriber::prelude::*;

/// A concrete engine type used during testing.
pub type MemEngine = StateEngine<ClientRequest, ClientResponse, MemApp, MemStorage, MemTransport>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::FULL)
        .with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A running engine over in-memory storage, transport and state machine.
pub struct EngineHarness {
    pub engine: MemEngine,
    pub storage: Arc<MemStorage>,
    pub transport: Arc<MemTransport>,
}

impl EngineHarness {
    /// Spawn an engine with no session listeners.
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_listeners(config, Vec::new())
    }

    /// Spawn an engine with the given session listeners.
    pub fn with_listeners(config: Arc<Config>, listeners: Vec<Box<dyn SessionListener>>) -> Self {
        let storage = Arc::new(MemStorage::new());
        let transport = Arc::new(MemTransport::new());
        let engine = StateEngine::new(config, MemApp::new(), listeners, storage.clone(), transport.clone());
        Self {
            engine,
            storage,
            transport,
        }
    }

    /// Spawn a fresh engine (and state machine) over existing storage, as a
    /// restart would.
    pub fn restart(&self, config: Arc<Config>) -> Self {
        let transport = Arc::new(MemTransport::new());
        let engine = StateEngine::new(config, MemApp::new(), Vec::new(), self.storage.clone(), transport.clone());
        Self {
            engine,
            storage: self.storage.clone(),
            transport,
        }
    }

    /// Append an entry to the log and apply it through the direct-entry path.
    pub async fn apply(&self, entry: Entry<ClientRequest>) -> EngineResult<ApplyResponse<ClientResponse>> {
        self.storage.append(entry.clone()).await;
        self.engine.apply_entry(entry).await
    }
}

/// The default test config.
pub fn test_config() -> Arc<Config> {
    Arc::new(
        Config::build("test".into())
            .session_timeout_min(1)
            .validate()
            .expect("failed to build engine config"),
    )
}

pub fn register(index: u64, client_id: &str, timeout: u64, timestamp: u64) -> Entry<ClientRequest> {
    Entry {
        index,
        term: 1,
        timestamp,
        payload: EntryPayload::Register(RegisterEntry {
            client_id: client_id.into(),
            timeout,
        }),
    }
}

pub fn command(index: u64, session_id: u64, sequence: u64, request: ClientRequest, timestamp: u64) -> Entry<ClientRequest> {
    Entry {
        index,
        term: 1,
        timestamp,
        payload: EntryPayload::Command(CommandEntry {
            session_id,
            sequence,
            data: request,
        }),
    }
}

pub fn echo(index: u64, session_id: u64, sequence: u64, text: &str, timestamp: u64) -> Entry<ClientRequest> {
    command(index, session_id, sequence, ClientRequest::Echo { text: text.into() }, timestamp)
}

pub fn publish(index: u64, session_id: u64, sequence: u64, events: Vec<&str>, timestamp: u64) -> Entry<ClientRequest> {
    command(
        index,
        session_id,
        sequence,
        ClientRequest::Publish {
            session: None,
            events: events.into_iter().map(String::from).collect(),
        },
        timestamp,
    )
}

pub fn keep_alive(
    index: u64,
    session_id: u64,
    command_sequence: u64,
    event_index: u64,
    timestamp: u64,
) -> Entry<ClientRequest> {
    Entry {
        index,
        term: 1,
        timestamp,
        payload: EntryPayload::KeepAlive(KeepAliveEntry {
            session_id,
            command_sequence,
            event_index,
        }),
    }
}

pub fn unregister(index: u64, session_id: u64, expired: bool, timestamp: u64) -> Entry<ClientRequest> {
    Entry {
        index,
        term: 1,
        timestamp,
        payload: EntryPayload::Unregister(UnregisterEntry { session_id, expired }),
    }
}

pub fn connect(index: u64, client_id: &str, timestamp: u64) -> Entry<ClientRequest> {
    Entry {
        index,
        term: 1,
        timestamp,
        payload: EntryPayload::Connect(ConnectEntry {
            client_id: client_id.into(),
        }),
    }
}

pub fn initialize(index: u64, timestamp: u64) -> Entry<ClientRequest> {
    Entry {
        index,
        term: 1,
        timestamp,
        payload: EntryPayload::Initialize,
    }
}

pub fn configuration(index: u64, timestamp: u64) -> Entry<ClientRequest> {
    Entry {
        index,
        term: 1,
        timestamp,
        payload: EntryPayload::Configuration,
    }
}

/// A session listener recording every invocation, in order.
#[derive(Clone, Default)]
pub struct RecordingListener {
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl SessionListener for RecordingListener {
    fn register(&mut self, session: &SessionInfo) {
        self.log.lock().unwrap().push(format!("register:{}", session.id));
    }

    fn unregister(&mut self, session: &SessionInfo) {
        self.log.lock().unwrap().push(format!("unregister:{}", session.id));
    }

    fn expire(&mut self, session: &SessionInfo) {
        self.log.lock().unwrap().push(format!("expire:{}", session.id));
    }

    fn close(&mut self, session: &SessionInfo) {
        self.log.lock().unwrap().push(format!("close:{}", session.id));
    }
}
