//! The client side of the event publication pipeline.
//!
//! Batches published by the server form a per-session chain stamped with
//! `(previous_index, event_index)` pairs. The sequencer verifies each link of
//! the chain, acknowledges duplicates idempotently, rejects gaps so the
//! server resends, and hands verified events to the application strictly in
//! index order.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::PublishError;
use crate::machine::PublishRequest;
use crate::machine::PublishResponse;
use crate::MessageSummary;
use crate::SessionId;

/// A single event delivered to the client application, in index order.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionEvent {
    /// The index of the entry whose command scope published the event.
    pub index: u64,
    /// The event payload.
    pub event: Bytes,
}

/// Orders server published events into the application's hands by index.
pub struct EventSequencer {
    session_id: SessionId,
    event_index: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSequencer {
    /// Create a sequencer for the given session, delivering ordered events on
    /// the given channel.
    pub fn new(session_id: SessionId, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            session_id,
            event_index: 0,
            tx,
        }
    }

    /// The highest event index received so far.
    pub fn event_index(&self) -> u64 {
        self.event_index
    }

    /// Handle an inbound publish request from the server.
    ///
    /// The response carries the client's event frontier: `ok` acknowledges
    /// through `event_index`; a not-ok response asks the server to resend
    /// everything after it.
    #[tracing::instrument(level="debug", skip(self, request), fields(request=%request.summary()))]
    pub fn handle_publish(&mut self, request: PublishRequest) -> Result<PublishResponse, PublishError> {
        if request.session_id != self.session_id {
            return Err(PublishError::UnknownSession(request.session_id));
        }

        // Already received: acknowledge idempotently.
        if request.event_index <= self.event_index {
            return Ok(PublishResponse {
                ok: true,
                event_index: self.event_index,
            });
        }

        // A broken chain link means a batch was lost or reordered in
        // transit; ask the server to resend from our frontier.
        if request.previous_index != self.event_index {
            tracing::debug!(
                expected = self.event_index,
                previous = request.previous_index,
                "publish chain broken, requesting resend"
            );
            return Ok(PublishResponse {
                ok: false,
                event_index: self.event_index,
            });
        }

        self.event_index = request.event_index;
        for event in request.events {
            let delivered = self.tx.send(SessionEvent {
                index: request.event_index,
                event,
            });
            if delivered.is_err() {
                tracing::warn!(index = request.event_index, "event receiver dropped, discarding event");
            }
        }
        Ok(PublishResponse {
            ok: true,
            event_index: self.event_index,
        })
    }
}
