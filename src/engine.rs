//! The request engine.
//!
//! [`ClientRequest`] owns one outgoing request from construction to the
//! terminal `Close` event. It is sans-io: the caller (the driver) injects
//! a [`Connector`], feeds socket input through `socket_data`/`socket_end`/
//! `socket_error`, pumps time through [`tick()`][ClientRequest::tick] and
//! drains lifecycle events through [`poll_event()`][ClientRequest::poll_event].
//!
//! Body writes before the transport opens are buffered; the head is not
//! serialized until the transport is there, which is what allows a
//! `Content-Length` to be synthesized for bodies that completed early.

use std::time::{Duration, Instant};

use http::{Method, StatusCode};
use log::{debug, trace};

use crate::buffer::{BodyBuffer, Payload};
use crate::error::Error;
use crate::options::{Protocol, RequestDescriptor, RequestOptions};
use crate::parser::{
    FeedOutcome, HeadAction, MessageSink, ParseSettings, ParserHandle, ParserPool, ResponseHead,
};
use crate::send::{write_request_head, SendBody};
use crate::sequencer::{Event, EventSequencer};
use crate::transport::{ConnectAddr, ConnectOutcome, ConnectParams, Connector, Transport};

#[derive(Debug)]
struct ResponseState {
    complete: bool,
    /// Body events are suppressed once the response is dumped.
    dumped: bool,
}

/// One outgoing HTTP/1.1 request.
pub struct ClientRequest {
    descriptor: RequestDescriptor,
    connector: Box<dyn Connector>,
    pool: ParserPool,

    buffer: BodyBuffer,
    write_count: u32,
    finished: bool,
    destroyed: bool,
    aborted: bool,
    cancelled: bool,
    connect_started: bool,
    /// The startup events have not been queued yet. They go out on the
    /// first pump, not synchronously from the constructor.
    pending_open: bool,

    conn: Option<Box<dyn Transport>>,
    send_body: Option<SendBody>,
    parser: Option<ParserHandle>,
    response: Option<ResponseState>,
    upgrade: Option<(Box<dyn Transport>, Vec<u8>)>,

    seq: EventSequencer,
    deadline: Option<Instant>,
}

impl ClientRequest {
    /// Validate the options and set the request up. Nothing is dialed and
    /// no event is queued until the request is pumped or written to.
    pub fn new(
        options: RequestOptions,
        connector: Box<dyn Connector>,
        pool: ParserPool,
    ) -> Result<Self, Error> {
        let descriptor = options.into_descriptor()?;
        let deadline = descriptor.timeout.map(|t| Instant::now() + t);

        Ok(ClientRequest {
            descriptor,
            connector,
            pool,
            buffer: BodyBuffer::new(),
            write_count: 0,
            finished: false,
            destroyed: false,
            aborted: false,
            cancelled: false,
            connect_started: false,
            pending_open: true,
            conn: None,
            send_body: None,
            parser: None,
            response: None,
            upgrade: None,
            seq: EventSequencer::new(),
            deadline,
        })
    }

    // ## Outgoing side

    /// Write a body chunk.
    ///
    /// Returns `true` while more writes are welcome. Before the transport
    /// opens, chunks are buffered and `false` means the buffer passed
    /// [`MAX_FAKE_BACKPRESSURE`][crate::MAX_FAKE_BACKPRESSURE]; writes are
    /// still accepted. The second buffered write triggers the dial, so a
    /// single-chunk body can go out with a known length.
    pub fn write<'a>(&mut self, payload: impl Into<Payload<'a>>) -> bool {
        if self.destroyed || self.cancelled || self.seq.is_closed() {
            return false;
        }
        if self.finished {
            self.seq.push(Event::Error(Error::WriteAfterEnd));
            return false;
        }

        let data = payload.into().into_bytes().into_owned();
        self.write_count += 1;

        if self.conn.is_some() {
            self.send_chunk(&data);
            return true;
        }

        let more = self.buffer.push(data);
        if self.write_count > 1 {
            self.connect_to_server();
        }
        more
    }

    /// Finish the body. Writing after this is an error.
    pub fn end(&mut self) -> &mut Self {
        if self.finished {
            if !self.destroyed {
                self.seq.push(Event::Error(Error::WriteAfterEnd));
            }
            return self;
        }
        self.finished = true;

        if self.conn.is_some() {
            let mut out = Vec::new();
            if let Some(send_body) = self.send_body.as_mut() {
                send_body.finish(&mut out);
            }
            self.transport_send(&out);
        } else {
            self.connect_to_server();
        }

        self.seq.maybe_finish(self.destroyed);
        self
    }

    /// Write a final chunk and finish the body.
    ///
    /// Unlike a separate [`write()`][Self::write] call, the chunk never
    /// triggers an early dial, so a short body still goes out with a
    /// synthesized `Content-Length`.
    pub fn end_with<'a>(&mut self, payload: impl Into<Payload<'a>>) -> &mut Self {
        let accepting =
            !self.finished && !self.destroyed && !self.cancelled && !self.seq.is_closed();
        if accepting {
            let data = payload.into().into_bytes().into_owned();
            self.write_count += 1;
            if self.conn.is_some() {
                self.send_chunk(&data);
            } else {
                self.buffer.push(data);
            }
        }
        self.end()
    }

    /// Force the head out without waiting for body writes.
    pub fn flush_headers(&mut self) {
        if !self.destroyed && !self.cancelled && self.conn.is_none() {
            self.connect_to_server();
        }
    }

    // ## Teardown

    /// Tear the request down. An optional error is surfaced first. An
    /// incomplete response gets an `Abort`; `Close` follows either way.
    /// Idempotent.
    pub fn destroy(&mut self, error: Option<Error>) -> &mut Self {
        if self.destroyed {
            return self;
        }
        self.destroyed = true;
        self.finished = true;
        if let Some(e) = error {
            self.seq.push(Event::Error(e));
        }
        self.cancel();
        self
    }

    /// Abort the request. Always queues `Abort`, then destroys.
    pub fn abort(&mut self) {
        if self.aborted || self.destroyed {
            return;
        }
        self.aborted = true;
        self.seq.push(Event::Abort);
        self.destroy(None);
    }

    /// (Re)arm the inactivity deadline. A zero duration disarms it.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.deadline = if timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + timeout)
        };
        self
    }

    /// Stop surfacing response body events. The body keeps being parsed
    /// and discarded so the exchange still completes.
    pub fn dump_response(&mut self) {
        if let Some(r) = self.response.as_mut() {
            r.dumped = true;
        }
    }

    // ## Driver inputs

    /// Advance time. Checks the abort signal and the deadline. The first
    /// call also releases the startup events.
    pub fn tick(&mut self, now: Instant) {
        self.run_startup();

        if let Some(signal) = self.descriptor.signal.clone() {
            if signal.is_aborted() && !self.destroyed && !self.cancelled {
                self.abort();
            }
        }

        if let Some(deadline) = self.deadline {
            if now >= deadline {
                self.deadline = None;
                self.seq.push(Event::Timeout);
                self.cancel();
            }
        }
    }

    /// Drain the next lifecycle event.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.run_startup();
        self.seq.poll()
    }

    /// Complete a dial the connector reported as pending.
    pub fn connect_done(&mut self, result: Result<Box<dyn Transport>, Error>) {
        if self.destroyed || self.cancelled {
            // The request went away while the dial was in flight.
            if let Ok(mut transport) = result {
                transport.close();
            }
            return;
        }
        match result {
            Ok(transport) => self.open_transport(transport),
            Err(e) => self.fail(e),
        }
    }

    /// Feed bytes that arrived on the transport.
    pub fn socket_data(&mut self, data: &[u8]) {
        if self.destroyed || self.cancelled {
            return;
        }
        let Some(mut parser) = self.parser.take() else {
            return;
        };

        let outcome = {
            let mut sink = Adapter {
                method: &self.descriptor.method,
                response: &mut self.response,
                seq: &mut self.seq,
            };
            parser.feed(data, &mut sink)
        };

        match outcome {
            Ok(FeedOutcome::Continue) => {
                self.parser = Some(parser);
            }
            Ok(FeedOutcome::Complete) => {
                parser.release();
                self.finish_exchange();
            }
            Ok(FeedOutcome::Upgraded(leftover)) => {
                parser.release();
                self.deadline = None;
                self.cancelled = true;
                self.send_body = None;
                if let Some(conn) = self.conn.take() {
                    self.upgrade = Some((conn, leftover));
                }
            }
            Ok(FeedOutcome::Rejected) => {
                parser.release();
                self.fail(Error::DuplicateResponse);
            }
            Err(e) => {
                parser.release();
                self.fail(e);
            }
        }

        // The deadline guards waiting for the response, not reading it.
        if self.response.is_some() {
            self.deadline = None;
        }
    }

    /// The transport reached EOF.
    pub fn socket_end(&mut self) {
        if self.destroyed || self.cancelled {
            return;
        }

        if let Some(mut parser) = self.parser.take() {
            let mut sink = Adapter {
                method: &self.descriptor.method,
                response: &mut self.response,
                seq: &mut self.seq,
            };
            parser.finish(&mut sink);
            parser.release();
        }

        if self.response_complete() {
            self.finish_exchange();
        } else {
            self.fail(Error::ConnectionReset);
        }
    }

    /// The transport failed. Swallowed on a request that is already gone.
    pub fn socket_error(&mut self, error: Error) {
        self.fail(error);
    }

    /// The transport closed underneath the request.
    pub fn socket_closed(&mut self) {
        if self.destroyed || self.cancelled {
            self.conn = None;
            return;
        }
        if let Some(parser) = self.parser.take() {
            parser.release();
        }
        if !self.response_complete() {
            self.seq.push(Event::Error(Error::ConnectionReset));
        }
        self.cancelled = true;
        self.destroyed = true;
        self.deadline = None;
        self.conn = None;
        self.send_body = None;
        self.seq.maybe_close(true);
    }

    /// After an upgrade (`101`, or a successful `CONNECT`), take the
    /// transport and any bytes that already arrived for the new protocol.
    pub fn take_upgrade(&mut self) -> Option<(Box<dyn Transport>, Vec<u8>)> {
        self.upgrade.take()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// No more events will ever be queued.
    pub fn is_closed(&self) -> bool {
        self.seq.is_closed()
    }

    // ## Internal

    fn response_complete(&self) -> bool {
        self.response.as_ref().map(|r| r.complete).unwrap_or(false)
    }

    /// Queue the startup events once: the transport assignment is
    /// observable from the first pump, and an `Expect: 100-continue`
    /// request invites the body right away.
    fn run_startup(&mut self) {
        if !self.pending_open {
            return;
        }
        self.pending_open = false;
        if self.destroyed {
            return;
        }
        self.seq.maybe_socket(false);
        if self.descriptor.expect_continue {
            self.seq.push(Event::Continue);
        }
    }

    fn connect_params(&self) -> ConnectParams {
        let addr = match &self.descriptor.socket_path {
            Some(path) => ConnectAddr::Unix { path: path.clone() },
            None => ConnectAddr::Tcp {
                host: self.descriptor.host.clone(),
                port: self.descriptor.port,
            },
        };

        let tls = (self.descriptor.protocol == Protocol::Https).then(|| {
            let mut tls = self.descriptor.tls.clone();
            if tls.server_name.is_none() {
                tls.server_name = Some(self.descriptor.host.clone());
            }
            tls
        });

        ConnectParams { addr, tls }
    }

    /// Dial, at most once per request. Never retried.
    fn connect_to_server(&mut self) {
        if self.connect_started || self.destroyed || self.cancelled {
            return;
        }
        self.connect_started = true;

        let params = self.connect_params();
        debug!("connect {:?}", params.addr);

        match self.connector.connect(&params) {
            ConnectOutcome::Connected(transport) => self.open_transport(transport),
            ConnectOutcome::Pending => {}
            ConnectOutcome::Failed(e) => self.fail(e),
        }
    }

    /// The transport is there. Serialize the head with the now-known
    /// framing, flush everything buffered and bind a parser.
    fn open_transport(&mut self, transport: Box<dyn Transport>) {
        let settings = ParseSettings {
            max_header_size: self.descriptor.max_header_size,
            max_headers_count: self.descriptor.max_headers_count,
            insecure_parser: self.descriptor.insecure_http_parser,
            join_duplicate_headers: self.descriptor.join_duplicate_headers,
        };
        self.parser = Some(
            self.pool
                .checkout(self.descriptor.method.clone(), settings),
        );

        let buffered = self.buffer.total() as u64;
        let (mut send_body, extra) = match SendBody::plan(&self.descriptor, self.finished, buffered)
        {
            Ok(plan) => plan,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        let mut out = write_request_head(&self.descriptor, extra.as_deref());

        for chunk in self.buffer.take() {
            if let Err(e) = send_body.encode(&chunk, &mut out) {
                self.fail(e);
                return;
            }
        }
        if self.finished {
            send_body.finish(&mut out);
        }

        trace!("transport open, flushing {} bytes", out.len());

        self.conn = Some(transport);
        self.send_body = Some(send_body);
        self.transport_send(&out);
        self.seq.maybe_socket(self.destroyed);
    }

    fn send_chunk(&mut self, data: &[u8]) {
        let mut out = Vec::with_capacity(data.len() + 16);
        if let Some(send_body) = self.send_body.as_mut() {
            if let Err(e) = send_body.encode(data, &mut out) {
                self.fail(e);
                return;
            }
        }
        self.transport_send(&out);
    }

    fn transport_send(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let result = match self.conn.as_mut() {
            Some(conn) => conn.send(data),
            None => Ok(()),
        };
        if let Err(e) = result {
            self.fail(e);
        }
    }

    /// The response completed normally. Tear the transport down and close.
    fn finish_exchange(&mut self) {
        self.cancelled = true;
        self.deadline = None;
        self.teardown_transport();
        self.seq.maybe_close(self.destroyed);
    }

    /// Failure teardown: error event, then close. No `Abort`.
    fn fail(&mut self, error: Error) {
        if self.destroyed || self.cancelled {
            return;
        }
        self.cancelled = true;
        self.deadline = None;
        if let Some(parser) = self.parser.take() {
            parser.release();
        }
        self.seq.push(Event::Error(error));
        self.teardown_transport();
        self.seq.maybe_close(self.destroyed);
        self.destroyed = true;
    }

    /// Cancellation teardown: an incomplete response gets an `Abort`,
    /// then close.
    fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.deadline = None;
        if let Some(parser) = self.parser.take() {
            parser.release();
        }
        self.dump_response();
        if !self.aborted && !self.response_complete() {
            self.aborted = true;
            self.seq.push(Event::Abort);
        }
        self.teardown_transport();
        self.seq.maybe_close(self.destroyed);
        self.destroyed = true;
    }

    fn teardown_transport(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
        self.send_body = None;
    }
}

/// Bridges parser callbacks onto the event queue.
struct Adapter<'a> {
    method: &'a Method,
    response: &'a mut Option<ResponseState>,
    seq: &'a mut EventSequencer,
}

impl MessageSink for Adapter<'_> {
    fn on_head(&mut self, head: ResponseHead) -> HeadAction {
        // A confused server sending a second response is not tolerated,
        // whatever the status of the extra head.
        if self.response.is_some() {
            return HeadAction::Reject;
        }

        let upgrade = head.status == StatusCode::SWITCHING_PROTOCOLS
            || (*self.method == Method::CONNECT && head.status.is_success());

        if !upgrade && head.is_informational() {
            if head.status == StatusCode::CONTINUE {
                self.seq.push(Event::Continue);
            }
            self.seq.push(Event::Information(head));
            return HeadAction::SkipBody;
        }

        *self.response = Some(ResponseState {
            // An upgrade never gets a parsed body, the exchange is done.
            complete: upgrade,
            dumped: false,
        });
        self.seq.push(Event::Response(head));

        if upgrade {
            HeadAction::Upgrade
        } else {
            HeadAction::Normal
        }
    }

    fn on_body(&mut self, chunk: &[u8]) {
        let dumped = self.response.as_ref().map(|r| r.dumped).unwrap_or(false);
        if !dumped {
            self.seq.push(Event::ResponseData(chunk.to_vec()));
        }
    }

    fn on_complete(&mut self) {
        if let Some(r) = self.response.as_mut() {
            r.complete = true;
            if !r.dumped {
                self.seq.push(Event::ResponseEnd);
            }
        }
    }
}
