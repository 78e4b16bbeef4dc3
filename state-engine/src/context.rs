//! The application context: deterministic time, scheduled callbacks, and
//! event publication scopes for state machine calls.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::machine::SessionInfo;
use crate::SessionId;

/// A shared, read-only snapshot of the live sessions, rebuilt by the engine
/// on every registry change.
pub(crate) type SessionRoster = Arc<BTreeMap<SessionId, SessionInfo>>;

/// A deterministic callback scheduled by the state machine.
type Callback<M> = Box<dyn FnOnce(&mut M, &mut ApplyContext<M>) + Send>;

struct Scheduled<M> {
    deadline: u64,
    seq: u64,
    task: Callback<M>,
}

// Min-heap on (deadline, seq): earliest deadline first, ties broken by
// insertion order.
impl<M> Ord for Scheduled<M> {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl<M> PartialOrd for Scheduled<M> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<M> PartialEq for Scheduled<M> {
    fn eq(&self, other: &Self) -> bool {
        (self.deadline, self.seq) == (other.deadline, other.seq)
    }
}

impl<M> Eq for Scheduled<M> {}

/// The kind of scope a state machine call executes under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeKind {
    /// A command scope: event publication is permitted and linearizable.
    Command,
    /// A query scope: event publication is discarded.
    Query,
}

struct Scope {
    index: u64,
    kind: ScopeKind,
    events: Vec<(SessionId, Bytes)>,
}

/// Events published to a single session by one committed scope.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ScopeEvents {
    pub session_id: SessionId,
    pub events: Vec<Bytes>,
}

/// The thread of execution for user state machine calls.
///
/// All state machine observable time flows through this context's
/// deterministic clock: on every apply carrying a leader timestamp `t_raw`,
/// the published time is `max(t_prev, t_raw)`, so time never runs backwards
/// on any replica regardless of leader clock skew.
pub struct ApplyContext<M> {
    time: u64,
    index: u64,
    seq: u64,
    roster: SessionRoster,
    scheduled: BinaryHeap<Scheduled<M>>,
    scope: Option<Scope>,
}

impl<M> Default for ApplyContext<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ApplyContext<M> {
    /// Create a detached context.
    ///
    /// The engine builds its own context internally; this constructor exists
    /// so applications can exercise a state machine directly in tests.
    pub fn new() -> Self {
        Self {
            time: 0,
            index: 0,
            seq: 0,
            roster: Arc::new(BTreeMap::new()),
            scheduled: BinaryHeap::new(),
            scope: None,
        }
    }

    /// Deterministic state machine time, in milliseconds.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// The index of the entry currently being applied.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Look up a live session by id.
    pub fn session(&self, id: SessionId) -> Option<&SessionInfo> {
        self.roster.get(&id)
    }

    /// Iterate over all live sessions.
    pub fn sessions(&self) -> impl Iterator<Item = &SessionInfo> {
        self.roster.values()
    }

    /// Publish an event to a session.
    ///
    /// Only permitted within a command scope; publications from query scopes
    /// or from outside any scope are discarded and logged.
    pub fn publish(&mut self, session_id: SessionId, event: Bytes) {
        match &mut self.scope {
            Some(scope) if scope.kind == ScopeKind::Command => {
                scope.events.push((session_id, event));
            }
            Some(_) => {
                tracing::warn!(session_id, "discarding event published from a query scope");
            }
            None => {
                tracing::warn!(session_id, "discarding event published outside a command scope");
            }
        }
    }

    /// Schedule a deterministic callback to run once the state machine clock
    /// reaches `deadline` (milliseconds).
    ///
    /// Callbacks run in deadline order, ties broken by scheduling order,
    /// before the entry that advanced the clock past their deadline is
    /// applied.
    pub fn schedule_at<F>(&mut self, deadline: u64, task: F)
    where F: FnOnce(&mut M, &mut ApplyContext<M>) + Send + 'static {
        let seq = self.seq;
        self.seq += 1;
        self.scheduled.push(Scheduled {
            deadline,
            seq,
            task: Box::new(task),
        });
    }

    /// Schedule a deterministic callback to run after `delay` milliseconds of
    /// state machine time.
    pub fn schedule_after<F>(&mut self, delay: u64, task: F)
    where F: FnOnce(&mut M, &mut ApplyContext<M>) + Send + 'static {
        self.schedule_at(self.time.saturating_add(delay), task);
    }

    pub(crate) fn set_roster(&mut self, roster: SessionRoster) {
        self.roster = roster;
    }

    /// Advance the clock and run every scheduled callback whose deadline has
    /// been reached, in deadline order.
    pub(crate) fn tick(&mut self, machine: &mut M, index: u64, time: u64) {
        self.time = self.time.max(time);
        self.index = index;
        loop {
            match self.scheduled.peek() {
                Some(next) if next.deadline <= self.time => {}
                _ => break,
            }
            let due = self.scheduled.pop().expect("peeked scheduled callback must pop");
            (due.task)(machine, self);
        }
    }

    /// Open a callback scope. Scopes never nest.
    pub(crate) fn init(&mut self, index: u64, time: u64, kind: ScopeKind) {
        debug_assert!(self.scope.is_none(), "state machine scopes never nest");
        self.time = self.time.max(time);
        self.index = index;
        self.scope = Some(Scope {
            index,
            kind,
            events: Vec::new(),
        });
    }

    /// Close the current scope, gathering the events it published into
    /// per-session batches in publication order.
    pub(crate) fn commit(&mut self) -> Vec<ScopeEvents> {
        let scope = match self.scope.take() {
            Some(scope) => scope,
            None => return Vec::new(),
        };
        let mut batches: Vec<ScopeEvents> = Vec::new();
        for (session_id, event) in scope.events {
            match batches.iter_mut().find(|b| b.session_id == session_id) {
                Some(batch) => batch.events.push(event),
                None => batches.push(ScopeEvents {
                    session_id,
                    events: vec![event],
                }),
            }
        }
        if !batches.is_empty() {
            tracing::debug!(index = scope.index, batches = batches.len(), "scope committed with events");
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        fired: Vec<&'static str>,
    }

    #[test]
    fn test_clock_is_monotone() {
        let mut ctx = ApplyContext::<Recorder>::new();
        let mut m = Recorder { fired: vec![] };
        ctx.tick(&mut m, 1, 100);
        assert_eq!(ctx.time(), 100);
        // A leader clock running backwards must not be observable.
        ctx.tick(&mut m, 2, 50);
        assert_eq!(ctx.time(), 100);
        ctx.tick(&mut m, 3, 150);
        assert_eq!(ctx.time(), 150);
    }

    #[test]
    fn test_tick_runs_callbacks_in_deadline_order_with_insertion_ties() {
        let mut ctx = ApplyContext::<Recorder>::new();
        let mut m = Recorder { fired: vec![] };
        ctx.schedule_at(200, |m: &mut Recorder, _ctx| m.fired.push("b"));
        ctx.schedule_at(100, |m: &mut Recorder, _ctx| m.fired.push("a"));
        ctx.schedule_at(200, |m: &mut Recorder, _ctx| m.fired.push("c"));
        ctx.tick(&mut m, 1, 150);
        assert_eq!(m.fired, vec!["a"]);
        ctx.tick(&mut m, 2, 200);
        assert_eq!(m.fired, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_callback_may_reschedule() {
        let mut ctx = ApplyContext::<Recorder>::new();
        let mut m = Recorder { fired: vec![] };
        ctx.schedule_at(100, |m: &mut Recorder, ctx| {
            m.fired.push("first");
            // Already due: runs within the same tick.
            ctx.schedule_at(100, |m: &mut Recorder, _ctx| m.fired.push("second"));
        });
        ctx.tick(&mut m, 1, 100);
        assert_eq!(m.fired, vec!["first", "second"]);
    }

    #[test]
    fn test_query_scope_discards_events() {
        let mut ctx = ApplyContext::<Recorder>::new();
        ctx.init(5, 100, ScopeKind::Query);
        ctx.publish(1, Bytes::from_static(b"dropped"));
        assert!(ctx.commit().is_empty());
    }

    #[test]
    fn test_commit_groups_events_per_session() {
        let mut ctx = ApplyContext::<Recorder>::new();
        ctx.init(5, 100, ScopeKind::Command);
        ctx.publish(1, Bytes::from_static(b"x"));
        ctx.publish(2, Bytes::from_static(b"y"));
        ctx.publish(1, Bytes::from_static(b"z"));
        let batches = ctx.commit();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].session_id, 1);
        assert_eq!(batches[0].events, vec![Bytes::from_static(b"x"), Bytes::from_static(b"z")]);
        assert_eq!(batches[1].session_id, 2);
        // A second commit without an open scope yields nothing.
        assert!(ctx.commit().is_empty());
    }
}
