//! Committed log entry data types.

use serde::Deserialize;
use serde::Serialize;

use crate::AppData;
use crate::MessageSummary;
use crate::SessionId;

/// A committed Raft log entry.
///
/// Entries delivered to the engine carry strictly increasing indices with no
/// gaps except those removed by compaction; compacted positions are read as
/// [`EntryPayload::Tombstone`] (or are absent from the log entirely) and are
/// skipped by the dispatcher while still advancing `last_applied`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    /// The entry's position in the log.
    pub index: u64,
    /// The term in which the entry was created.
    pub term: u64,
    /// The leader's wall clock at proposal time, in milliseconds.
    ///
    /// State machine observable time is derived from this value through the
    /// deterministic clock, never from the local clock.
    pub timestamp: u64,
    /// This entry's payload.
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}.{}@{}:{}", self.term, self.index, self.timestamp, self.payload.summary())
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// Open a new session for a client.
    Register(RegisterEntry),
    /// Refresh a session's liveness and acknowledge commands and events.
    KeepAlive(KeepAliveEntry),
    /// Close a session, either expired by the leader or by client request.
    Unregister(UnregisterEntry),
    /// Record a client (re)connection; connections count as keep-alives.
    Connect(ConnectEntry),
    /// An application command to be applied to the state machine.
    #[serde(bound = "D: AppData")]
    Command(CommandEntry<D>),
    /// Committed by a new leader; bumps every session's timestamp so that
    /// leadership changes do not starve sessions.
    Initialize,
    /// A cluster configuration change. No state machine effect.
    Configuration,
    /// An entry removed by log compaction.
    Tombstone,
}

impl<D: AppData> MessageSummary for EntryPayload<D> {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Register(r) => format!("register client={} timeout={}", r.client_id, r.timeout),
            EntryPayload::KeepAlive(k) => format!(
                "keep-alive session={} command-seq={} event-index={}",
                k.session_id, k.command_sequence, k.event_index
            ),
            EntryPayload::Unregister(u) => {
                format!("unregister session={} expired={}", u.session_id, u.expired)
            }
            EntryPayload::Connect(c) => format!("connect client={}", c.client_id),
            EntryPayload::Command(c) => format!("command session={} seq={}", c.session_id, c.sequence),
            EntryPayload::Initialize => "initialize".to_string(),
            EntryPayload::Configuration => "configuration".to_string(),
            EntryPayload::Tombstone => "tombstone".to_string(),
        }
    }
}

/// Payload of a session registration entry.
///
/// The id of the created session is the index of this entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterEntry {
    /// The application supplied client identity.
    pub client_id: String,
    /// The requested session timeout, in milliseconds. Clamped into the
    /// engine's configured bounds.
    pub timeout: u64,
}

/// Payload of a session keep-alive entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveEntry {
    /// The session being kept alive.
    pub session_id: SessionId,
    /// The highest command sequence for which the client has received a
    /// response. Cached results at or below this sequence are evicted.
    pub command_sequence: u64,
    /// The highest entry index whose events the client has received. Event
    /// batches at or below this index are dropped; the rest are resent.
    pub event_index: u64,
}

/// Payload of a session unregister entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnregisterEntry {
    /// The session being closed.
    pub session_id: SessionId,
    /// True if the leader expired the session; false if the client closed it.
    pub expired: bool,
}

/// Payload of a client connection entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectEntry {
    /// The application supplied client identity.
    pub client_id: String,
}

/// Payload of an application command entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandEntry<D: AppData> {
    /// The session the command belongs to.
    pub session_id: SessionId,
    /// The client assigned command sequence number. Zero disables response
    /// caching for this command.
    pub sequence: u64,
    /// The application specific command payload.
    #[serde(bound = "D: AppData")]
    pub data: D,
}

/// Retention hint attached to an entry once the engine no longer needs it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompactionMode {
    /// The entry may be removed once superseded in log order.
    Sequential,
    /// The entry must be retained until replicated to a majority.
    Quorum,
    /// The entry must be retained until a snapshot covers it.
    Full,
    /// The entry must be retained until its associated session expires.
    Expiring,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Data(String);
    impl crate::AppData for Data {}

    #[test]
    fn test_entry_summary() {
        let entry = Entry {
            index: 7,
            term: 2,
            timestamp: 100,
            payload: EntryPayload::<Data>::KeepAlive(KeepAliveEntry {
                session_id: 1,
                command_sequence: 3,
                event_index: 5,
            }),
        };
        assert_eq!(entry.summary(), "2.7@100:keep-alive session=1 command-seq=3 event-index=5");
    }
}
