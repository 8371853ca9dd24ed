//! Outgoing request serialization.
//!
//! The head is written as a whole once the framing is known. The body
//! framing is picked in [`SendBody::plan`]: an explicit `content-length`
//! or `transfer-encoding: chunked` header is honored, otherwise a
//! `Content-Length` is synthesized when the body is already complete and
//! chunked encoding is used when it is not.

use std::fmt::Write;

use http::Method;
use log::trace;

use crate::error::Error;
use crate::options::RequestDescriptor;

/// Serialize the request line and headers.
///
/// `extra_header` carries a synthesized framing line. A `Host` header is
/// synthesized from the target unless the caller set one; the default
/// port is left out of it.
pub(crate) fn write_request_head(d: &RequestDescriptor, extra_header: Option<&str>) -> Vec<u8> {
    let mut head = String::with_capacity(256);

    let _ = write!(head, "{} {} HTTP/1.1\r\n", d.method, d.path);

    match d.headers.get(http::header::HOST) {
        Some(v) => {
            let _ = write!(head, "Host: {}\r\n", String::from_utf8_lossy(v.as_bytes()));
        }
        None => {
            let _ = write!(head, "Host: {}\r\n", synthesized_host(d));
        }
    }

    for (name, value) in d.headers.iter() {
        if name == http::header::HOST {
            continue;
        }
        let _ = write!(
            head,
            "{}: {}\r\n",
            name,
            String::from_utf8_lossy(value.as_bytes())
        );
    }

    if let Some(extra) = extra_header {
        let _ = write!(head, "{}\r\n", extra);
    }

    head.push_str("\r\n");

    trace!("request head: {} bytes", head.len());

    head.into_bytes()
}

// An ipv6 literal needs its brackets back in the Host header.
fn synthesized_host(d: &RequestDescriptor) -> String {
    match (d.host.contains(':'), d.use_default_port) {
        (true, true) => format!("[{}]", d.host),
        (true, false) => format!("[{}]:{}", d.host, d.port),
        (false, true) => d.host.clone(),
        (false, false) => format!("{}:{}", d.host, d.port),
    }
}

/// Outgoing body framing state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SendBody {
    /// No body at all.
    Empty,
    /// `content-length` framing, counting down.
    Sized { remaining: u64 },
    /// `transfer-encoding: chunked` framing.
    Chunked { ended: bool },
}

// Methods where an empty completed body still gets a Content-Length: 0.
fn usually_has_body(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

impl SendBody {
    /// Pick the framing for a request whose head is about to go out.
    ///
    /// `ended` says whether the caller already finished the body;
    /// `buffered` is the total body size accumulated so far. Returns the
    /// framing plus the header line to synthesize, if any.
    pub fn plan(
        d: &RequestDescriptor,
        ended: bool,
        buffered: u64,
    ) -> Result<(SendBody, Option<String>), Error> {
        if let Some(len) = d.content_length()? {
            return Ok((SendBody::Sized { remaining: len }, None));
        }

        if d.is_chunked() {
            return Ok((SendBody::Chunked { ended: false }, None));
        }

        if ended {
            if buffered == 0 && !usually_has_body(&d.method) {
                return Ok((SendBody::Empty, None));
            }
            let extra = format!("Content-Length: {}", buffered);
            return Ok((SendBody::Sized { remaining: buffered }, Some(extra)));
        }

        let extra = "Transfer-Encoding: chunked".to_string();
        Ok((SendBody::Chunked { ended: false }, Some(extra)))
    }

    /// Frame one body chunk into `out`.
    pub fn encode(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        if chunk.is_empty() {
            return Ok(());
        }

        match self {
            SendBody::Empty => Err(Error::WriteAfterEnd),
            SendBody::Sized { remaining } => {
                let len = chunk.len() as u64;
                if len > *remaining {
                    return Err(Error::BodyLargerThanContentLength);
                }
                *remaining -= len;
                out.extend_from_slice(chunk);
                Ok(())
            }
            SendBody::Chunked { ended } => {
                if *ended {
                    return Err(Error::WriteAfterEnd);
                }
                let mut line = String::with_capacity(8);
                let _ = write!(line, "{:x}\r\n", chunk.len());
                out.extend_from_slice(line.as_bytes());
                out.extend_from_slice(chunk);
                out.extend_from_slice(b"\r\n");
                Ok(())
            }
        }
    }

    /// Frame the end of the body into `out`.
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        if let SendBody::Chunked { ended } = self {
            if !*ended {
                *ended = true;
                out.extend_from_slice(b"0\r\n\r\n");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::RequestOptions;

    fn descriptor(options: RequestOptions) -> RequestDescriptor {
        options.into_descriptor().unwrap()
    }

    #[test]
    fn request_line_and_host() {
        let d = descriptor(RequestOptions::new().hostname("example.test").path("/x"));
        let head = write_request_head(&d, None);
        assert_eq!(head, b"GET /x HTTP/1.1\r\nHost: example.test\r\n\r\n");
    }

    #[test]
    fn non_default_port_in_host() {
        let d = descriptor(RequestOptions::new().hostname("example.test").port(8080));
        let head = write_request_head(&d, None);
        assert_eq!(head, b"GET / HTTP/1.1\r\nHost: example.test:8080\r\n\r\n");
    }

    #[test]
    fn ipv6_host_gets_brackets_back() {
        let d = descriptor(RequestOptions::parse_url("http://[::1]:8080/").unwrap());
        let head = write_request_head(&d, None);
        assert_eq!(head, b"GET / HTTP/1.1\r\nHost: [::1]:8080\r\n\r\n");

        let d = descriptor(RequestOptions::parse_url("http://[::1]/").unwrap());
        let head = write_request_head(&d, None);
        assert_eq!(head, b"GET / HTTP/1.1\r\nHost: [::1]\r\n\r\n");
    }

    #[test]
    fn caller_host_header_wins() {
        let d = descriptor(
            RequestOptions::new()
                .hostname("example.test")
                .header("host", "other.test")
                .unwrap(),
        );
        let head = write_request_head(&d, None);
        assert_eq!(head, b"GET / HTTP/1.1\r\nHost: other.test\r\n\r\n");
    }

    #[test]
    fn extra_header_goes_last() {
        let d = descriptor(RequestOptions::new().hostname("h"));
        let head = write_request_head(&d, Some("Content-Length: 2"));
        assert_eq!(
            head,
            b"GET / HTTP/1.1\r\nHost: h\r\nContent-Length: 2\r\n\r\n"
        );
    }

    #[test]
    fn default_port_in_url_is_left_out_of_host() {
        let d = descriptor(RequestOptions::parse_url("http://h:80/x").unwrap());
        let head = write_request_head(&d, None);
        assert!(head.starts_with(b"GET /x HTTP/1.1\r\nHost: h\r\n"));
    }

    #[test]
    fn header_input_forms_serialize_identically() {
        let from_iter = descriptor(
            RequestOptions::new()
                .hostname("h")
                .headers([("x-a", "1"), ("x-b", "2")])
                .unwrap(),
        );
        let from_pairs = descriptor(
            RequestOptions::new()
                .hostname("h")
                .header_pairs(&[("x-a", "1"), ("x-b", "2")])
                .unwrap(),
        );
        let from_flat = descriptor(
            RequestOptions::new()
                .hostname("h")
                .headers_flat(&["x-a", "1", "x-b", "2"])
                .unwrap(),
        );

        let expected = write_request_head(&from_iter, None);
        assert_eq!(write_request_head(&from_pairs, None), expected);
        assert_eq!(write_request_head(&from_flat, None), expected);
    }

    #[test]
    fn plan_honors_explicit_content_length() -> Result<(), Error> {
        let d = descriptor(
            RequestOptions::new()
                .method("POST")
                .header("content-length", "10")
                .unwrap(),
        );
        let (body, extra) = SendBody::plan(&d, false, 0)?;
        assert_eq!(body, SendBody::Sized { remaining: 10 });
        assert_eq!(extra, None);
        Ok(())
    }

    #[test]
    fn plan_synthesizes_content_length_for_ended_body() -> Result<(), Error> {
        let d = descriptor(RequestOptions::new().method("POST"));
        let (body, extra) = SendBody::plan(&d, true, 2)?;
        assert_eq!(body, SendBody::Sized { remaining: 2 });
        assert_eq!(extra.as_deref(), Some("Content-Length: 2"));
        Ok(())
    }

    #[test]
    fn plan_empty_get_has_no_framing() -> Result<(), Error> {
        let d = descriptor(RequestOptions::new());
        let (body, extra) = SendBody::plan(&d, true, 0)?;
        assert_eq!(body, SendBody::Empty);
        assert_eq!(extra, None);
        Ok(())
    }

    #[test]
    fn plan_empty_post_gets_zero_content_length() -> Result<(), Error> {
        let d = descriptor(RequestOptions::new().method("POST"));
        let (body, extra) = SendBody::plan(&d, true, 0)?;
        assert_eq!(body, SendBody::Sized { remaining: 0 });
        assert_eq!(extra.as_deref(), Some("Content-Length: 0"));
        Ok(())
    }

    #[test]
    fn plan_open_body_is_chunked() -> Result<(), Error> {
        let d = descriptor(RequestOptions::new().method("POST"));
        let (body, extra) = SendBody::plan(&d, false, 0)?;
        assert_eq!(body, SendBody::Chunked { ended: false });
        assert_eq!(extra.as_deref(), Some("Transfer-Encoding: chunked"));
        Ok(())
    }

    #[test]
    fn chunked_encoding_frames_and_terminates() -> Result<(), Error> {
        let mut body = SendBody::Chunked { ended: false };
        let mut out = Vec::new();
        body.encode(b"hello", &mut out)?;
        body.finish(&mut out);
        assert_eq!(out, b"5\r\nhello\r\n0\r\n\r\n");
        Ok(())
    }

    #[test]
    fn sized_overflow_is_an_error() {
        let mut body = SendBody::Sized { remaining: 3 };
        let mut out = Vec::new();
        assert_eq!(
            body.encode(b"hello", &mut out),
            Err(Error::BodyLargerThanContentLength)
        );
    }

    #[test]
    fn finish_is_idempotent() {
        let mut body = SendBody::Chunked { ended: false };
        let mut out = Vec::new();
        body.finish(&mut out);
        body.finish(&mut out);
        assert_eq!(out, b"0\r\n\r\n");
    }
}
