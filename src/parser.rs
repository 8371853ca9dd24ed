//! Incremental response parsing on top of httparse.
//!
//! The engine does not call httparse directly. It checks a
//! [`ResponseParser`] out of a [`ParserPool`], binds it to the open
//! transport for the duration of one exchange and feeds it raw socket
//! bytes. The parser reports the incoming message lifecycle through the
//! [`MessageSink`] callbacks; the sink decides per head whether to parse
//! the body normally, skip it, stop for an upgrade or reject the message
//! outright.

use std::cell::RefCell;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use log::trace;

use crate::chunk::Dechunker;
use crate::error::Error;

pub(crate) const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;
pub(crate) const DEFAULT_MAX_HEADERS: usize = 100;

/// Status line and headers of an incoming response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub status: StatusCode,
    /// Status message as sent on the wire, which may differ from the
    /// canonical reason phrase.
    pub message: String,
    pub version: Version,
    pub headers: HeaderMap,
    /// Headers in wire order with original casing, duplicates included.
    pub raw_headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn is_informational(&self) -> bool {
        self.status.is_informational()
    }
}

/// Sink decision after seeing a response head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadAction {
    /// Parse the body according to the response framing.
    Normal,
    /// This head has no body (informational response); keep parsing for
    /// the next head.
    SkipBody,
    /// Stop parsing entirely. Remaining bytes belong to another protocol.
    Upgrade,
    /// The message must not be tolerated (duplicate response).
    Reject,
}

/// Receives the incoming message lifecycle from [`ResponseParser::feed`].
pub trait MessageSink {
    fn on_head(&mut self, head: ResponseHead) -> HeadAction;
    fn on_body(&mut self, chunk: &[u8]);
    fn on_complete(&mut self);
}

/// Per-exchange parser configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParseSettings {
    pub max_header_size: Option<usize>,
    pub max_headers_count: Option<usize>,
    /// Accept responses that violate strict header syntax.
    pub insecure_parser: bool,
    /// Fold repeated header names into one comma separated value
    /// (`set-cookie` excepted).
    pub join_duplicate_headers: bool,
}

/// What a call to [`ResponseParser::feed`] resulted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedOutcome {
    /// All input consumed, message not complete yet.
    Continue,
    /// The message is complete. Further input is not parsed.
    Complete,
    /// The sink requested an upgrade. Carries the bytes that were already
    /// buffered but belong to the new protocol.
    Upgraded(Vec<u8>),
    /// The sink rejected the head.
    Rejected,
}

#[derive(Debug)]
enum ParseState {
    Head,
    Body(BodyReader),
    Done,
}

#[derive(Debug)]
enum BodyReader {
    Sized {
        remaining: u64,
    },
    Chunked {
        dechunker: Dechunker,
        /// Bytes the dechunker could not consume yet (a length line or
        /// crlf split across socket reads), re-offered on the next feed.
        pending: Vec<u8>,
    },
    CloseDelimited,
}

/// Incremental HTTP/1.1 response parser bound to one exchange at a time.
#[derive(Debug)]
pub struct ResponseParser {
    settings: ParseSettings,
    method: Method,
    state: ParseState,
    head: Vec<u8>,
}

enum HeadStep {
    Incomplete,
    Parsed { used: usize, head: ResponseHead },
}

impl ResponseParser {
    fn new() -> Self {
        ResponseParser {
            settings: ParseSettings::default(),
            method: Method::GET,
            state: ParseState::Head,
            head: Vec::new(),
        }
    }

    /// Reset the parser for a new exchange.
    pub(crate) fn bind(&mut self, method: Method, settings: ParseSettings) {
        self.settings = settings;
        self.method = method;
        self.state = ParseState::Head;
        self.head.clear();
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, ParseState::Done)
    }

    /// Feed socket bytes, reporting progress to `sink`.
    pub fn feed(&mut self, input: &[u8], sink: &mut dyn MessageSink) -> Result<FeedOutcome, Error> {
        match self.state {
            ParseState::Head => {
                self.head.extend_from_slice(input);
                self.drive_head(sink)
            }
            ParseState::Body(_) => self.drive_body(input, sink),
            ParseState::Done => Ok(FeedOutcome::Complete),
        }
    }

    /// The socket reached EOF. Completes a close delimited body; any other
    /// unfinished state is left as is for the engine to judge.
    pub fn finish(&mut self, sink: &mut dyn MessageSink) {
        if let ParseState::Body(BodyReader::CloseDelimited) = self.state {
            sink.on_complete();
            self.state = ParseState::Done;
        }
    }

    fn max_header_size(&self) -> usize {
        self.settings.max_header_size.unwrap_or(DEFAULT_MAX_HEADER_SIZE)
    }

    fn drive_head(&mut self, sink: &mut dyn MessageSink) -> Result<FeedOutcome, Error> {
        loop {
            match parse_head(&self.head, &self.settings)? {
                HeadStep::Incomplete => {
                    if self.head.len() > self.max_header_size() {
                        return Err(Error::HeadersTooLarge);
                    }
                    return Ok(FeedOutcome::Continue);
                }
                HeadStep::Parsed { used, head } => {
                    if used > self.max_header_size() {
                        return Err(Error::HeadersTooLarge);
                    }

                    trace!("response head: {} {}", head.status, head.message);

                    // Decide the framing before the head is given away.
                    let reader = self.body_reader(&head)?;

                    let action = sink.on_head(head);
                    self.head.drain(..used);

                    match action {
                        HeadAction::Reject => {
                            self.state = ParseState::Done;
                            return Ok(FeedOutcome::Rejected);
                        }
                        HeadAction::Upgrade => {
                            let leftover = mem::take(&mut self.head);
                            self.state = ParseState::Done;
                            return Ok(FeedOutcome::Upgraded(leftover));
                        }
                        HeadAction::SkipBody => {
                            // Informational response. The next head may
                            // already be buffered.
                            continue;
                        }
                        HeadAction::Normal => match reader {
                            None => {
                                sink.on_complete();
                                self.state = ParseState::Done;
                                return Ok(FeedOutcome::Complete);
                            }
                            Some(reader) => {
                                self.state = ParseState::Body(reader);
                                let leftover = mem::take(&mut self.head);
                                return self.drive_body(&leftover, sink);
                            }
                        },
                    }
                }
            }
        }
    }

    fn drive_body(&mut self, input: &[u8], sink: &mut dyn MessageSink) -> Result<FeedOutcome, Error> {
        let ParseState::Body(reader) = &mut self.state else {
            return Ok(FeedOutcome::Complete);
        };

        let done = match reader {
            BodyReader::Sized { remaining } => {
                let take = (*remaining).min(input.len() as u64) as usize;
                if take > 0 {
                    sink.on_body(&input[..take]);
                    *remaining -= take as u64;
                }
                *remaining == 0
            }
            BodyReader::Chunked { dechunker, pending } => {
                pending.extend_from_slice(input);
                let mut out = Vec::with_capacity(pending.len());
                let used = dechunker.input(pending, &mut out)?;
                pending.drain(..used);
                if !out.is_empty() {
                    sink.on_body(&out);
                }
                dechunker.is_ended()
            }
            BodyReader::CloseDelimited => {
                if !input.is_empty() {
                    sink.on_body(input);
                }
                false
            }
        };

        if done {
            sink.on_complete();
            self.state = ParseState::Done;
            Ok(FeedOutcome::Complete)
        } else {
            Ok(FeedOutcome::Continue)
        }
    }

    /// Response body framing per RFC 9112. `None` means there is no body.
    fn body_reader(&self, head: &ResponseHead) -> Result<Option<BodyReader>, Error> {
        let status = head.status.as_u16();
        let is_success = (200..300).contains(&status);

        let has_no_body =
            // All responses to HEAD lack a body regardless of framing headers.
            self.method == Method::HEAD ||
            // A client must ignore framing headers in a successful CONNECT.
            (is_success && self.method == Method::CONNECT) ||
            head.status.is_informational() ||
            matches!(status, 204 | 304);

        if has_no_body {
            return Ok(None);
        }

        let chunked = head
            .headers
            .get_all(http::header::TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case("chunked"));

        if chunked {
            // Chunked wins over content-length.
            return Ok(Some(BodyReader::Chunked {
                dechunker: Dechunker::new(),
                pending: Vec::new(),
            }));
        }

        let mut lengths = head.headers.get_all(http::header::CONTENT_LENGTH).iter();

        if let Some(v) = lengths.next() {
            if lengths.next().is_some() {
                return Err(Error::TooManyContentLengthHeaders);
            }
            let len = v
                .to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or(Error::BadContentLengthHeader)?;

            return Ok(if len == 0 {
                None
            } else {
                Some(BodyReader::Sized { remaining: len })
            });
        }

        Ok(Some(BodyReader::CloseDelimited))
    }
}

fn parse_head(buf: &[u8], settings: &ParseSettings) -> Result<HeadStep, Error> {
    let max_headers = settings.max_headers_count.unwrap_or(DEFAULT_MAX_HEADERS);
    let mut headers = vec![httparse::EMPTY_HEADER; max_headers];
    let mut response = httparse::Response::new(&mut headers);

    let mut config = httparse::ParserConfig::default();
    if settings.insecure_parser {
        config
            .allow_spaces_after_header_name_in_responses(true)
            .allow_obsolete_multiline_headers_in_responses(true)
            .ignore_invalid_headers_in_responses(true);
    }

    let used = match config.parse_response(&mut response, buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(HeadStep::Incomplete),
    };

    let version = match response.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(Error::UnsupportedVersion),
    };

    let code = response.code.ok_or(Error::ResponseInvalidStatus)?;
    let status = StatusCode::from_u16(code).map_err(|_| Error::ResponseInvalidStatus)?;
    let message = response.reason.unwrap_or("").to_string();

    let mut raw_headers = Vec::with_capacity(response.headers.len());
    let mut map: HeaderMap = HeaderMap::with_capacity(response.headers.len());

    for h in response.headers.iter() {
        raw_headers.push((
            h.name.to_string(),
            String::from_utf8_lossy(h.value).into_owned(),
        ));

        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| Error::BadHeader(e.to_string()))?;

        let join = settings.join_duplicate_headers
            && name != http::header::SET_COOKIE
            && map.contains_key(&name);

        if join {
            // unwrap is ok because contains_key() was checked above.
            let existing = map.get(&name).unwrap();
            let joined = [existing.as_bytes(), b", ", h.value].concat();
            let value = HeaderValue::from_bytes(&joined)
                .map_err(|e| Error::BadHeader(e.to_string()))?;
            map.insert(name, value);
        } else {
            let value = HeaderValue::from_bytes(h.value)
                .map_err(|e| Error::BadHeader(e.to_string()))?;
            map.append(name, value);
        }
    }

    Ok(HeadStep::Parsed {
        used,
        head: ResponseHead {
            status,
            message,
            version,
            headers: map,
            raw_headers,
        },
    })
}

/// Pool the engine checks parsers out of, injected at construction.
///
/// Clones share the same pool.
#[derive(Debug, Clone, Default)]
pub struct ParserPool {
    free: Rc<RefCell<Vec<ResponseParser>>>,
}

impl ParserPool {
    pub fn new() -> Self {
        ParserPool::default()
    }

    /// Check a parser out for one exchange. Allocates when the pool is
    /// empty.
    pub fn checkout(&self, method: Method, settings: ParseSettings) -> ParserHandle {
        let mut parser = self
            .free
            .borrow_mut()
            .pop()
            .unwrap_or_else(ResponseParser::new);
        parser.bind(method, settings);
        ParserHandle {
            parser,
            pool: self.clone(),
        }
    }

    /// Number of parked parsers.
    pub fn available(&self) -> usize {
        self.free.borrow().len()
    }
}

/// Exclusively checked out parser.
///
/// Releasing consumes the handle, so a parser cannot be released twice or
/// used after release.
#[derive(Debug)]
pub struct ParserHandle {
    parser: ResponseParser,
    pool: ParserPool,
}

impl ParserHandle {
    /// Return the parser to its pool.
    pub fn release(self) {
        self.pool.free.borrow_mut().push(self.parser);
    }
}

impl Deref for ParserHandle {
    type Target = ResponseParser;

    fn deref(&self) -> &Self::Target {
        &self.parser
    }
}

impl DerefMut for ParserHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.parser
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        heads: Vec<ResponseHead>,
        body: Vec<u8>,
        complete: bool,
        force: Option<HeadAction>,
    }

    impl MessageSink for RecordingSink {
        fn on_head(&mut self, head: ResponseHead) -> HeadAction {
            let action = match self.force.take() {
                Some(a) => a,
                None if head.is_informational() => HeadAction::SkipBody,
                None => HeadAction::Normal,
            };
            self.heads.push(head);
            action
        }

        fn on_body(&mut self, chunk: &[u8]) {
            self.body.extend_from_slice(chunk);
        }

        fn on_complete(&mut self) {
            self.complete = true;
        }
    }

    fn parser() -> ResponseParser {
        ParserPool::new()
            .checkout(Method::GET, ParseSettings::default())
            .parser
    }

    #[test]
    fn sized_body_across_feeds() -> Result<(), Error> {
        let mut p = parser();
        let mut sink = RecordingSink::default();

        let r = p.feed(b"HTTP/1.1 200 OK\r\ncontent-len", &mut sink)?;
        assert_eq!(r, FeedOutcome::Continue);
        assert!(sink.heads.is_empty());

        let r = p.feed(b"gth: 5\r\n\r\nhel", &mut sink)?;
        assert_eq!(r, FeedOutcome::Continue);
        assert_eq!(sink.heads.len(), 1);
        assert_eq!(sink.body, b"hel");

        let r = p.feed(b"lo", &mut sink)?;
        assert_eq!(r, FeedOutcome::Complete);
        assert_eq!(sink.body, b"hello");
        assert!(sink.complete);
        Ok(())
    }

    #[test]
    fn chunked_body() -> Result<(), Error> {
        let mut p = parser();
        let mut sink = RecordingSink::default();

        let input = b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let r = p.feed(input, &mut sink)?;
        assert_eq!(r, FeedOutcome::Complete);
        assert_eq!(sink.body, b"hello");
        assert!(sink.complete);
        Ok(())
    }

    #[test]
    fn chunked_body_split_mid_length_line() -> Result<(), Error> {
        let mut p = parser();
        let mut sink = RecordingSink::default();

        let r = p.feed(
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5",
            &mut sink,
        )?;
        assert_eq!(r, FeedOutcome::Continue);

        let r = p.feed(b"\r\nhello\r\n0\r\n\r\n", &mut sink)?;
        assert_eq!(r, FeedOutcome::Complete);
        assert_eq!(sink.body, b"hello");
        assert!(sink.complete);
        Ok(())
    }

    #[test]
    fn chunked_body_split_before_chunk_crlf() -> Result<(), Error> {
        let mut p = parser();
        let mut sink = RecordingSink::default();

        let r = p.feed(
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello",
            &mut sink,
        )?;
        assert_eq!(r, FeedOutcome::Continue);
        assert_eq!(sink.body, b"hello");

        let r = p.feed(b"\r\n0\r\n\r\n", &mut sink)?;
        assert_eq!(r, FeedOutcome::Complete);
        assert!(sink.complete);
        Ok(())
    }

    #[test]
    fn informational_then_final_in_one_feed() -> Result<(), Error> {
        let mut p = parser();
        let mut sink = RecordingSink::default();

        let input =
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nhi";
        let r = p.feed(input, &mut sink)?;
        assert_eq!(r, FeedOutcome::Complete);
        assert_eq!(sink.heads.len(), 2);
        assert_eq!(sink.heads[0].status, StatusCode::CONTINUE);
        assert_eq!(sink.heads[1].status, StatusCode::OK);
        assert_eq!(sink.body, b"hi");
        Ok(())
    }

    #[test]
    fn head_request_has_no_body() -> Result<(), Error> {
        let pool = ParserPool::new();
        let mut p = pool.checkout(Method::HEAD, ParseSettings::default());
        let mut sink = RecordingSink::default();

        let input = b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\n";
        let r = p.feed(input, &mut sink)?;
        assert_eq!(r, FeedOutcome::Complete);
        assert!(sink.body.is_empty());
        assert!(sink.complete);
        Ok(())
    }

    #[test]
    fn close_delimited_body_needs_finish() -> Result<(), Error> {
        let mut p = parser();
        let mut sink = RecordingSink::default();

        let r = p.feed(b"HTTP/1.0 200 OK\r\n\r\nhello", &mut sink)?;
        assert_eq!(r, FeedOutcome::Continue);
        assert_eq!(sink.body, b"hello");
        assert!(!sink.complete);

        p.finish(&mut sink);
        assert!(sink.complete);
        assert!(p.is_complete());
        Ok(())
    }

    #[test]
    fn upgrade_returns_leftover() -> Result<(), Error> {
        let mut p = parser();
        let mut sink = RecordingSink {
            force: Some(HeadAction::Upgrade),
            ..Default::default()
        };

        let input = b"HTTP/1.1 101 Switching Protocols\r\n\r\nraw bytes";
        let r = p.feed(input, &mut sink)?;
        assert_eq!(r, FeedOutcome::Upgraded(b"raw bytes".to_vec()));
        Ok(())
    }

    #[test]
    fn reject_stops_parsing() -> Result<(), Error> {
        let mut p = parser();
        let mut sink = RecordingSink {
            force: Some(HeadAction::Reject),
            ..Default::default()
        };

        let r = p.feed(b"HTTP/1.1 200 OK\r\n\r\n", &mut sink)?;
        assert_eq!(r, FeedOutcome::Rejected);
        Ok(())
    }

    #[test]
    fn oversized_head_is_an_error() {
        let pool = ParserPool::new();
        let settings = ParseSettings {
            max_header_size: Some(64),
            ..Default::default()
        };
        let mut p = pool.checkout(Method::GET, settings);
        let mut sink = RecordingSink::default();

        let mut input = b"HTTP/1.1 200 OK\r\nx-filler: ".to_vec();
        input.extend_from_slice(&[b'a'; 128]);

        assert_eq!(p.feed(&input, &mut sink), Err(Error::HeadersTooLarge));
    }

    #[test]
    fn oversized_head_in_one_feed_is_an_error() {
        let pool = ParserPool::new();
        let settings = ParseSettings {
            max_header_size: Some(64),
            ..Default::default()
        };
        let mut p = pool.checkout(Method::GET, settings);
        let mut sink = RecordingSink::default();

        // complete in a single feed, so the limit must be checked on the
        // parsed head too
        let mut input = b"HTTP/1.1 200 OK\r\nx-filler: ".to_vec();
        input.extend_from_slice(&[b'a'; 128]);
        input.extend_from_slice(b"\r\ncontent-length: 0\r\n\r\n");

        assert_eq!(p.feed(&input, &mut sink), Err(Error::HeadersTooLarge));
    }

    #[test]
    fn too_many_headers_is_an_error() {
        let pool = ParserPool::new();
        let settings = ParseSettings {
            max_headers_count: Some(2),
            ..Default::default()
        };
        let mut p = pool.checkout(Method::GET, settings);
        let mut sink = RecordingSink::default();

        let input = b"HTTP/1.1 200 OK\r\na: 1\r\nb: 2\r\nc: 3\r\n\r\n";
        assert_eq!(
            p.feed(input, &mut sink),
            Err(Error::HttpParseTooManyHeaders)
        );
    }

    #[test]
    fn join_duplicate_headers() -> Result<(), Error> {
        let pool = ParserPool::new();
        let settings = ParseSettings {
            join_duplicate_headers: true,
            ..Default::default()
        };
        let mut p = pool.checkout(Method::GET, settings);
        let mut sink = RecordingSink::default();

        let input = b"HTTP/1.1 204 No Content\r\nx-list: a\r\nx-list: b\r\n\r\n";
        p.feed(input, &mut sink)?;

        let head = &sink.heads[0];
        assert_eq!(head.headers.get("x-list").unwrap(), "a, b");
        // raw headers keep the duplicates
        assert_eq!(head.raw_headers.len(), 2);
        Ok(())
    }

    #[test]
    fn pool_reuses_released_parsers() {
        let pool = ParserPool::new();
        assert_eq!(pool.available(), 0);

        let handle = pool.checkout(Method::GET, ParseSettings::default());
        assert_eq!(pool.available(), 0);

        handle.release();
        assert_eq!(pool.available(), 1);

        let _again = pool.checkout(Method::GET, ParseSettings::default());
        assert_eq!(pool.available(), 0);
    }
}
