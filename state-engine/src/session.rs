//! Server side session records and the session registry.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::engine::Outcome;
use crate::engine::QueryTx;
use crate::machine::PublishRequest;
use crate::machine::SessionInfo;
use crate::AppData;
use crate::AppDataResponse;
use crate::SessionId;

/// The lifecycle state of a session.
///
/// A session becomes `Suspicious` when the deterministic clock outruns its
/// timeout, but only a leader committed UNREGISTER entry may move it to
/// `Expired` or `Closed`: log compaction can elide keep-alive entries, so a
/// local timeout cannot distinguish client death from compaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created but not yet opened by its REGISTER callback.
    Inactive,
    /// Live and current on keep-alives.
    Open,
    /// Overdue on keep-alives; still serviced.
    Suspicious,
    /// Expired by a leader committed unregister.
    Expired,
    /// Closed by client request.
    Closed,
}

impl SessionState {
    /// Whether commands and queries are accepted in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Open | SessionState::Suspicious)
    }
}

/// A batch of events produced for one session by a single command scope.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct EventBatch {
    /// The `event_index` of the batch published before this one.
    pub previous_index: u64,
    /// The index of the entry whose scope produced this batch.
    pub event_index: u64,
    /// The events, in publication order.
    pub events: Vec<Bytes>,
}

impl EventBatch {
    pub(crate) fn to_publish(&self, session_id: SessionId) -> PublishRequest {
        PublishRequest {
            session_id,
            previous_index: self.previous_index,
            event_index: self.event_index,
            events: self.events.clone(),
        }
    }
}

/// A read-only query parked until `last_applied` reaches its barrier.
pub(crate) struct WaitingQuery<D: AppData, R: AppDataResponse> {
    pub sequence: u64,
    pub data: D,
    pub tx: QueryTx<R>,
}

/// A server side session record.
///
/// Mutated only by the engine task, in committed log order.
pub(crate) struct Session<D: AppData, R: AppDataResponse> {
    /// The session id, equal to the index of its REGISTER entry.
    pub id: SessionId,
    pub client_id: String,
    /// The session timeout, in milliseconds.
    pub timeout: u64,
    /// The most recent state machine time observed for this session.
    pub timestamp: u64,
    pub state: SessionState,

    /// The highest command sequence applied for this session.
    pub command_sequence: u64,
    /// The highest sequence the client is known to have submitted.
    pub request_sequence: u64,
    /// The index at which the last event batch was published.
    pub event_index: u64,

    /// Cached responses by sequence, pruned on keep-alive.
    results: BTreeMap<u64, Outcome<R>>,
    /// Sequences at or below this mark have been evicted.
    command_low_water_mark: u64,
    /// Unacknowledged event batches, oldest first.
    pending_events: VecDeque<EventBatch>,
    /// Parked queries by barrier index.
    waiting_queries: BTreeMap<u64, Vec<WaitingQuery<D, R>>>,

    /// The index of the entry serving as the session's live keep-alive
    /// reference, retained for compaction coordination.
    last_keep_alive_entry: Option<u64>,
    /// The index of the session's live connect entry.
    last_connect_entry: Option<u64>,
}

impl<D: AppData, R: AppDataResponse> Session<D, R> {
    pub(crate) fn new(id: SessionId, client_id: String, timeout: u64, timestamp: u64) -> Self {
        Self {
            id,
            client_id,
            timeout,
            timestamp,
            state: SessionState::Inactive,
            command_sequence: 0,
            request_sequence: 0,
            event_index: 0,
            results: BTreeMap::new(),
            command_low_water_mark: 0,
            pending_events: VecDeque::new(),
            waiting_queries: BTreeMap::new(),
            last_keep_alive_entry: None,
            last_connect_entry: None,
        }
    }

    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            client_id: self.client_id.clone(),
            timeout: self.timeout,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Mark the session open. Valid only for inactive or trusted sessions.
    pub(crate) fn open(&mut self) {
        self.state = SessionState::Open;
    }

    /// Mark the session suspicious. Never removes it.
    pub(crate) fn suspect(&mut self) {
        if self.state == SessionState::Open {
            tracing::debug!(session_id = self.id, "session is overdue on keep-alives, marking suspicious");
            self.state = SessionState::Suspicious;
        }
    }

    /// An observed keep-alive or connect returns a suspicious session to open.
    pub(crate) fn trust(&mut self) {
        if self.state == SessionState::Suspicious {
            self.state = SessionState::Open;
        }
    }

    pub(crate) fn expire(&mut self) {
        self.state = SessionState::Expired;
    }

    pub(crate) fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// The cached response for a command sequence, if retained.
    pub(crate) fn cached_result(&self, sequence: u64) -> Option<&Outcome<R>> {
        self.results.get(&sequence)
    }

    /// Cache the response for a command sequence.
    pub(crate) fn cache_result(&mut self, sequence: u64, outcome: Outcome<R>) {
        self.results.insert(sequence, outcome);
    }

    /// Evict cached responses at or below `sequence`, returning the entry
    /// indices whose retention the eviction ends.
    pub(crate) fn clear_results(&mut self, sequence: u64) -> Vec<u64> {
        let mut released = Vec::new();
        if sequence > self.command_low_water_mark {
            let evict: Vec<u64> = self.results.range(..=sequence).map(|(seq, _)| *seq).collect();
            for seq in evict {
                if let Some(outcome) = self.results.remove(&seq) {
                    released.push(outcome.index);
                }
            }
            self.command_low_water_mark = sequence;
        }
        released
    }

    /// Stamp and enqueue an event batch produced at `index`, forming the next
    /// link of the session's event chain.
    pub(crate) fn enqueue_events(&mut self, index: u64, events: Vec<Bytes>) -> EventBatch {
        let batch = EventBatch {
            previous_index: self.event_index,
            event_index: index,
            events,
        };
        self.pending_events.push_back(batch.clone());
        self.event_index = index;
        batch
    }

    /// Drop batches the client has acknowledged. Returns true if anything
    /// was released.
    pub(crate) fn clear_events(&mut self, acked_index: u64) -> bool {
        let mut changed = false;
        while let Some(front) = self.pending_events.front() {
            if front.event_index > acked_index {
                break;
            }
            self.pending_events.pop_front();
            changed = true;
        }
        changed
    }

    /// The unacknowledged batches still owed to the client, oldest first.
    pub(crate) fn pending_events(&self) -> impl Iterator<Item = &EventBatch> {
        self.pending_events.iter()
    }

    pub(crate) fn pending_event_count(&self) -> usize {
        self.pending_events.len()
    }

    /// The highest index whose events the client has acknowledged.
    ///
    /// Derived from the event queue: acknowledged batches are removed from
    /// the front in order, so the oldest pending batch's `previous_index` is
    /// exactly the acknowledged frontier. With nothing pending the session
    /// does not constrain completion, so the engine's `last_applied` is
    /// reported.
    pub(crate) fn complete_index(&self, last_applied: u64) -> u64 {
        match self.pending_events.front() {
            Some(batch) => batch.previous_index,
            None => last_applied,
        }
    }

    /// Park a query until `last_applied` reaches `barrier`.
    pub(crate) fn park_query(&mut self, barrier: u64, query: WaitingQuery<D, R>) {
        self.waiting_queries.entry(barrier).or_insert_with(Vec::new).push(query);
    }

    /// Take every parked query whose barrier is at or below `index`.
    pub(crate) fn take_ready_queries(&mut self, index: u64) -> Vec<WaitingQuery<D, R>> {
        let mut ready = Vec::new();
        let pending = self.waiting_queries.split_off(&(index + 1));
        for (_, queries) in std::mem::replace(&mut self.waiting_queries, pending) {
            ready.extend(queries);
        }
        ready
    }

    /// Take every parked query, regardless of barrier.
    pub(crate) fn take_all_queries(&mut self) -> Vec<WaitingQuery<D, R>> {
        let mut ready = Vec::new();
        for (_, queries) in std::mem::take(&mut self.waiting_queries) {
            ready.extend(queries);
        }
        ready
    }

    /// Record `index` as the session's live keep-alive entry, returning the
    /// index it supersedes.
    pub(crate) fn set_keep_alive_entry(&mut self, index: u64) -> Option<u64> {
        self.last_keep_alive_entry.replace(index)
    }

    /// Record `index` as the session's live connect entry; connections count
    /// as keep-alives, so both slots are replaced. Returns the superseded
    /// indices.
    pub(crate) fn set_connect_entry(&mut self, index: u64) -> Vec<u64> {
        let mut released = Vec::new();
        if let Some(prev) = self.last_connect_entry.replace(index) {
            released.push(prev);
        }
        if let Some(prev) = self.last_keep_alive_entry.replace(index) {
            if !released.contains(&prev) {
                released.push(prev);
            }
        }
        released
    }

    /// The entry indices the session still holds live references to,
    /// releasable once the session is destroyed.
    pub(crate) fn held_entries(&self) -> Vec<u64> {
        let mut held = vec![self.id];
        for outcome in self.results.values() {
            held.push(outcome.index);
        }
        if let Some(index) = self.last_keep_alive_entry {
            if !held.contains(&index) {
                held.push(index);
            }
        }
        if let Some(index) = self.last_connect_entry {
            if !held.contains(&index) {
                held.push(index);
            }
        }
        held
    }
}

/// The registry of live sessions, indexed by session id and by client id.
pub(crate) struct SessionRegistry<D: AppData, R: AppDataResponse> {
    sessions: BTreeMap<SessionId, Session<D, R>>,
    clients: HashMap<String, SessionId>,
}

impl<D: AppData, R: AppDataResponse> SessionRegistry<D, R> {
    pub(crate) fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            clients: HashMap::new(),
        }
    }

    pub(crate) fn register(&mut self, session: Session<D, R>) {
        self.clients.insert(session.client_id.clone(), session.id);
        self.sessions.insert(session.id, session);
    }

    pub(crate) fn lookup(&self, id: SessionId) -> Option<&Session<D, R>> {
        self.sessions.get(&id)
    }

    pub(crate) fn lookup_mut(&mut self, id: SessionId) -> Option<&mut Session<D, R>> {
        self.sessions.get_mut(&id)
    }

    pub(crate) fn lookup_by_client_mut(&mut self, client_id: &str) -> Option<&mut Session<D, R>> {
        let id = *self.clients.get(client_id)?;
        self.sessions.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: SessionId) -> Option<Session<D, R>> {
        let session = self.sessions.remove(&id)?;
        // Only unmap the client if it has not re-registered under a newer
        // session in the meantime.
        if self.clients.get(&session.client_id) == Some(&id) {
            self.clients.remove(&session.client_id);
        }
        Some(session)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Session<D, R>> {
        self.sessions.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session<D, R>> {
        self.sessions.values_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Data(String);
    impl AppData for Data {}

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Resp(String);
    impl AppDataResponse for Resp {}

    fn outcome(index: u64, text: &str) -> Outcome<Resp> {
        Outcome {
            index,
            event_index: 0,
            result: Ok(Resp(text.into())),
        }
    }

    fn session() -> Session<Data, Resp> {
        Session::new(1, "c1".into(), 5000, 100)
    }

    #[test]
    fn test_suspect_and_trust() {
        let mut s = session();
        s.open();
        s.suspect();
        assert_eq!(s.state, SessionState::Suspicious);
        assert!(s.is_active());
        s.trust();
        assert_eq!(s.state, SessionState::Open);
    }

    #[test]
    fn test_suspect_does_not_resurrect_closed_sessions() {
        let mut s = session();
        s.open();
        s.close();
        s.suspect();
        assert_eq!(s.state, SessionState::Closed);
        s.trust();
        assert_eq!(s.state, SessionState::Closed);
    }

    #[test]
    fn test_result_cache_eviction_tracks_low_water_mark() {
        let mut s = session();
        s.cache_result(1, outcome(2, "a"));
        s.cache_result(2, outcome(3, "b"));
        s.cache_result(3, outcome(4, "c"));

        let released = s.clear_results(2);
        assert_eq!(released, vec![2, 3]);
        assert!(s.cached_result(1).is_none());
        assert!(s.cached_result(2).is_none());
        assert!(s.cached_result(3).is_some());

        // Replays of an already cleared sequence release nothing further.
        assert!(s.clear_results(2).is_empty());
    }

    #[test]
    fn test_event_chain_stamping() {
        let mut s = session();
        let first = s.enqueue_events(2, vec![Bytes::from_static(b"x")]);
        let second = s.enqueue_events(3, vec![Bytes::from_static(b"y")]);
        assert_eq!((first.previous_index, first.event_index), (0, 2));
        assert_eq!((second.previous_index, second.event_index), (2, 3));
        assert_eq!(s.event_index, 3);
    }

    #[test]
    fn test_complete_index_follows_acknowledgements() {
        let mut s = session();
        assert_eq!(s.complete_index(9), 9);

        s.enqueue_events(2, vec![Bytes::from_static(b"x")]);
        s.enqueue_events(3, vec![Bytes::from_static(b"y")]);
        assert_eq!(s.complete_index(9), 0);

        assert!(s.clear_events(2));
        assert_eq!(s.complete_index(9), 2);

        assert!(s.clear_events(3));
        assert_eq!(s.complete_index(9), 9);
    }

    #[test]
    fn test_connect_entry_replaces_both_slots() {
        let mut s = session();
        assert!(s.set_connect_entry(4).is_empty());
        assert_eq!(s.set_keep_alive_entry(6), Some(4));
        let released = s.set_connect_entry(8);
        assert_eq!(released, vec![4, 6]);
    }

    #[test]
    fn test_registry_client_index_survives_re_registration() {
        let mut reg: SessionRegistry<Data, Resp> = SessionRegistry::new();
        reg.register(Session::new(1, "c1".into(), 5000, 0));
        reg.register(Session::new(5, "c1".into(), 5000, 0));
        // Removing the stale session must not unmap the newer one.
        reg.remove(1);
        assert_eq!(reg.lookup_by_client_mut("c1").unwrap().id, 5);
    }
}
