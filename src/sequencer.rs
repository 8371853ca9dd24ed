//! Lifecycle event queue with ordering guarantees.
//!
//! All observable state changes funnel through the [`EventSequencer`]. It
//! is a plain FIFO queue plus a handful of monotonic flags that enforce
//! the relative ordering rules: `Socket` before `Prefinish`, `Prefinish`
//! before `Finish` and before `Close`, and each of those at most once per
//! request.

use std::collections::VecDeque;

use crate::error::Error;
use crate::parser::ResponseHead;

/// An observable lifecycle event, drained through
/// [`ClientRequest::poll_event`][crate::ClientRequest::poll_event].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The transport assignment became observable. At most once, and never
    /// on a request destroyed before it.
    Socket,
    /// Request headers went out (or the request was set up), inviting more
    /// body writes. Also queued for a `100 Continue` response.
    Continue,
    /// An informational (1xx) response head arrived. Never terminal.
    Information(ResponseHead),
    /// The final response head arrived. At most once.
    Response(ResponseHead),
    /// A decoded piece of the response body.
    ResponseData(Vec<u8>),
    /// The response body is complete.
    ResponseEnd,
    /// The inactivity deadline passed. The request is cancelled right
    /// after; an `Abort` follows.
    Timeout,
    /// The request was torn down before the response completed.
    Abort,
    /// The outgoing side is about to finish. At most once, after `Socket`.
    Prefinish,
    /// The outgoing message is fully handed to the transport. At most
    /// once, after `Prefinish`.
    Finish,
    /// Terminal. Nothing is queued after this.
    Close,
    /// A failure. The request is torn down around it.
    Error(Error),
}

/// Progress of the gated lifecycle events, in emission order. The state
/// only ever moves forward; a skipped stage (socket on a destroyed
/// request) is jumped over, never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
enum EmitState {
    #[default]
    Idle,
    Socket,
    Prefinish,
    Finish,
}

#[derive(Debug, Default)]
pub(crate) struct EventSequencer {
    queue: VecDeque<Event>,
    state: EmitState,
    // close has its own flag so any number of independent triggers
    // (socket close, destroy, error) collapse into one emission.
    closed: bool,
}

impl EventSequencer {
    pub fn new() -> Self {
        EventSequencer::default()
    }

    /// Queue an event without ordering checks. Nothing is queued after
    /// close.
    pub fn push(&mut self, event: Event) {
        if self.closed {
            return;
        }
        self.queue.push_back(event);
    }

    /// Queue `Socket` once, unless the request was destroyed before the
    /// transport became observable.
    pub fn maybe_socket(&mut self, destroyed: bool) {
        if self.state >= EmitState::Socket || self.closed || destroyed {
            return;
        }
        self.state = EmitState::Socket;
        self.queue.push_back(Event::Socket);
    }

    /// Queue `Prefinish` once, with `Socket` forced out first.
    pub fn maybe_prefinish(&mut self, destroyed: bool) {
        if self.state >= EmitState::Prefinish || self.closed {
            return;
        }
        self.maybe_socket(destroyed);
        self.state = EmitState::Prefinish;
        self.queue.push_back(Event::Prefinish);
    }

    /// Queue `Finish` once, with `Socket` and `Prefinish` forced out first.
    pub fn maybe_finish(&mut self, destroyed: bool) {
        if self.state >= EmitState::Finish || self.closed {
            return;
        }
        self.maybe_prefinish(destroyed);
        self.state = EmitState::Finish;
        self.queue.push_back(Event::Finish);
    }

    /// Queue the terminal `Close` once, with `Prefinish` forced out first.
    pub fn maybe_close(&mut self, destroyed: bool) {
        if self.closed {
            return;
        }
        self.maybe_prefinish(destroyed);
        self.closed = true;
        self.queue.push_back(Event::Close);
    }

    pub fn poll(&mut self) -> Option<Event> {
        self.queue.pop_front()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
