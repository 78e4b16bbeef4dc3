//! The replicated state machine application engine of a Raft-based consensus
//! system.
//!
//! This crate implements the subsystem which consumes committed log entries in
//! index order and applies them deterministically to a user supplied state
//! machine, while managing client sessions, linearizable command semantics,
//! read-only query ordering, snapshotting coupled to log compaction, and the
//! event publication pipeline which ties server side state changes to client
//! visible notifications.
//!
//! Leader election, log replication, the on-disk log format and the wire
//! protocol are external collaborators, consumed through the traits in
//! [`storage`] and [`machine`]. Entries handed to the engine are assumed to
//! have already been committed by consensus.

pub mod client;
pub mod config;
pub mod context;
mod core;
pub mod engine;
pub mod entry;
pub mod error;
pub mod machine;
pub mod metrics;
pub mod session;
pub mod storage;

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use crate::client::EventSequencer;
pub use crate::config::Config;
pub use crate::config::ConfigError;
pub use crate::config::SnapshotPolicy;
pub use crate::context::ApplyContext;
pub use crate::engine::ApplyResponse;
pub use crate::engine::AppliedData;
pub use crate::engine::Outcome;
pub use crate::engine::QueryRequest;
pub use crate::engine::StateEngine;
pub use crate::error::EngineError;
pub use crate::error::EngineResult;
pub use crate::error::PublishError;
pub use crate::error::UserError;
pub use crate::machine::Commit;
pub use crate::machine::EventTransport;
pub use crate::machine::PublishRequest;
pub use crate::machine::PublishResponse;
pub use crate::machine::SessionInfo;
pub use crate::machine::SessionListener;
pub use crate::machine::StateMachine;
pub use crate::metrics::EngineMetrics;
pub use crate::session::SessionState;
pub use crate::storage::EngineStorage;
pub use crate::storage::SnapshotMeta;
pub use crate::storage::SnapshotReader;
pub use crate::storage::SnapshotWriter;

pub use async_trait;

/// A Raft session ID, equal to the log index of the session's REGISTER entry.
pub type SessionId = u64;

/// A trait defining application specific command and query payloads.
///
/// The intention of this trait is that applications which are using this crate
/// will be able to use their own concrete data types throughout their
/// application without having to serialize and deserialize their data as it
/// passes through the engine. Instead, the engine will deal with their data
/// directly.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific response data.
///
/// The engine caches values of this type per `(session, sequence)` pair in
/// order to de-duplicate retried commands, so a response must compare and
/// clone deterministically.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait for producing a compact, loggable summary of a message.
pub trait MessageSummary {
    /// Return a brief string summary for tracing output.
    fn summary(&self) -> String;
}
