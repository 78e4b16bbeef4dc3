//! Error types exposed by this crate.

use serde::Deserialize;
use serde::Serialize;

use crate::SessionId;

/// A result type where the error variant is always an `EngineError`.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Error variants related to applying entries to the state machine engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The session named by an entry or query is absent or no longer active.
    ///
    /// Surfaced to the caller; never fatal to the replica.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    /// The dispatcher read an entry whose index disagrees with the requested
    /// one. This indicates log corruption and halts the engine.
    #[error("inconsistent entry index: requested {requested}, read {read}")]
    InconsistentIndex {
        /// The index the dispatcher asked the log for.
        requested: u64,
        /// The index carried by the entry the log returned.
        read: u64,
    },

    /// An engine operation was submitted while the log is closed.
    #[error("the log is closed")]
    LogClosed,

    /// An invariant violation: a cache miss on a replayed sequence, an entry
    /// type the dispatcher cannot route, or corrupted bookkeeping. Halts the
    /// engine, as it indicates replica divergence.
    #[error("internal engine fault: {0}")]
    Internal(String),

    /// An error coming from the storage layer.
    #[error("{0}")]
    Storage(anyhow::Error),

    /// The engine is shutting down.
    #[error("the engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Whether this error indicates replica divergence and must halt the engine.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::InconsistentIndex { .. } | EngineError::Internal(_) | EngineError::Storage(_)
        )
    }
}

/// An error produced by the user state machine while applying an entry.
///
/// User errors are deterministic outcomes, not replica faults: the same entry
/// produces the same error on every replica, so the error is captured into
/// the cached result and returned to the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{0}")]
pub struct UserError(pub String);

impl UserError {
    pub(crate) fn from_anyhow(err: &anyhow::Error) -> Self {
        Self(format!("{:#}", err))
    }
}

/// An error returned to a publish request on the client side.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// The request targets a session other than the local one.
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
}
