//! Request construction.
//!
//! [`RequestOptions`] is the mutable builder the caller fills in, by hand
//! or from a URL. [`RequestDescriptor`] is the validated, immutable form
//! the engine works from; the conversion in [`RequestOptions::into_descriptor`]
//! is where all input validation happens.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

use crate::error::Error;
use crate::signal::Signal;

/// Scheme of the request. Decides the default port and whether the
/// connector is asked for tls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }
}

/// Tls parameters handed through to the connector verbatim. The engine
/// itself never interprets these.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsOptions {
    pub ca: Vec<Vec<u8>>,
    pub cert: Vec<Vec<u8>>,
    pub key: Vec<Vec<u8>>,
    pub passphrase: Option<String>,
    pub ciphers: Option<String>,
    pub server_name: Option<String>,
    pub secure_options: u32,
    pub reject_unauthorized: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        TlsOptions {
            ca: Vec::new(),
            cert: Vec::new(),
            key: Vec::new(),
            passphrase: None,
            ciphers: None,
            server_name: None,
            secure_options: 0,
            reject_unauthorized: true,
        }
    }
}

/// Builder for one request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    protocol: Option<Protocol>,
    host: Option<String>,
    hostname: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    socket_path: Option<String>,
    method: Option<String>,
    headers: HeaderMap,
    tls: TlsOptions,
    auth: Option<String>,
    timeout: Option<Duration>,
    signal: Option<Signal>,
    max_header_size: Option<usize>,
    max_headers_count: Option<usize>,
    insecure_http_parser: bool,
    join_duplicate_headers: bool,
}

// Characters allowed in a method token (RFC 9110 tchar).
fn is_token_byte(b: u8) -> bool {
    matches!(
        b,
        b'!' | b'#'
            | b'$'
            | b'%'
            | b'&'
            | b'\''
            | b'*'
            | b'+'
            | b'-'
            | b'.'
            | b'^'
            | b'_'
            | b'`'
            | b'|'
            | b'~'
    ) || b.is_ascii_alphanumeric()
}

impl RequestOptions {
    pub fn new() -> Self {
        RequestOptions::default()
    }

    /// Seed the builder from an absolute http or https URL. Userinfo in
    /// the URL becomes [`auth`][Self::auth].
    pub fn parse_url(input: &str) -> Result<Self, Error> {
        let url = Url::parse(input).map_err(|e| Error::InvalidUrl(e.to_string()))?;

        let protocol = match url.scheme() {
            "http" => Protocol::Http,
            "https" => Protocol::Https,
            other => return Err(Error::UnsupportedScheme(other.to_string())),
        };

        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl("missing host".to_string()))?
            // Url keeps the brackets around ipv6 literals.
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        let auth = if url.username().is_empty() && url.password().is_none() {
            None
        } else {
            let mut auth = url.username().to_string();
            auth.push(':');
            auth.push_str(url.password().unwrap_or(""));
            Some(auth)
        };

        let mut options = RequestOptions::new();
        options.protocol = Some(protocol);
        options.hostname = Some(host);
        options.port = url.port();
        options.path = Some(path);
        options.auth = auth;
        Ok(options)
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Host the request targets. [`hostname`][Self::hostname] takes
    /// precedence when both are set.
    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn hostname(mut self, hostname: &str) -> Self {
        self.hostname = Some(hostname.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    /// Connect over a unix domain socket instead of tcp.
    pub fn socket_path(mut self, path: &str) -> Self {
        self.socket_path = Some(path.to_string());
        self
    }

    pub fn method(mut self, method: &str) -> Self {
        self.method = Some(method.to_string());
        self
    }

    /// Set one header, replacing earlier values of the same name.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, Error> {
        let name = header_name(name)?;
        let value = header_value(value)?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Replace all headers with the given name/value pairs.
    pub fn headers<'a>(
        mut self,
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, Error> {
        self.headers.clear();
        for (name, value) in pairs {
            self.headers.append(header_name(name)?, header_value(value)?);
        }
        Ok(self)
    }

    /// Append name/value pairs, keeping earlier values. `host` is special
    /// cased and only set when absent.
    pub fn header_pairs(mut self, pairs: &[(&str, &str)]) -> Result<Self, Error> {
        for (name, value) in pairs {
            let name = header_name(name)?;
            let value = header_value(value)?;
            if name == http::header::HOST && self.headers.contains_key(&name) {
                continue;
            }
            self.headers.append(name, value);
        }
        Ok(self)
    }

    /// Append headers from a flat `[name, value, name, value, ..]` list.
    pub fn headers_flat(mut self, flat: &[&str]) -> Result<Self, Error> {
        if flat.len() % 2 != 0 {
            return Err(Error::BadHeaderList("odd number of entries"));
        }
        for pair in flat.chunks_exact(2) {
            self.headers.append(header_name(pair[0])?, header_value(pair[1])?);
        }
        Ok(self)
    }

    /// `user:password` credentials, sent as a basic authorization header
    /// unless one is already set.
    pub fn auth(mut self, auth: &str) -> Self {
        self.auth = Some(auth.to_string());
        self
    }

    /// Inactivity timeout, armed once the request starts.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// External cancellation signal, checked on every tick.
    pub fn signal(mut self, signal: Signal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    pub fn max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = Some(size);
        self
    }

    pub fn max_headers_count(mut self, count: usize) -> Self {
        self.max_headers_count = Some(count);
        self
    }

    pub fn insecure_http_parser(mut self, yes: bool) -> Self {
        self.insecure_http_parser = yes;
        self
    }

    pub fn join_duplicate_headers(mut self, yes: bool) -> Self {
        self.join_duplicate_headers = yes;
        self
    }

    /// Validate and freeze into the form the engine runs from.
    pub(crate) fn into_descriptor(self) -> Result<RequestDescriptor, Error> {
        let method = match self.method {
            None => Method::GET,
            Some(m) => {
                if m.is_empty() || !m.bytes().all(is_token_byte) {
                    return Err(Error::InvalidMethod(m));
                }
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| Error::InvalidMethod(m))?
            }
        };

        let path = self.path.unwrap_or_else(|| "/".to_string());
        if !path.chars().all(|c| ('\u{21}'..='\u{ff}').contains(&c)) {
            return Err(Error::UnescapedPath);
        }

        let protocol = self.protocol.unwrap_or(Protocol::Http);

        let host = self
            .hostname
            .or(self.host)
            .unwrap_or_else(|| "localhost".to_string());

        let use_default_port = self.port.is_none();
        let port = self.port.unwrap_or_else(|| protocol.default_port());

        let mut headers = self.headers;

        if let Some(auth) = &self.auth {
            if !headers.contains_key(http::header::AUTHORIZATION) {
                let encoded = BASE64_STANDARD.encode(auth.as_bytes());
                let value = header_value(&format!("Basic {}", encoded))?;
                headers.insert(http::header::AUTHORIZATION, value);
            }
        }

        let expect_continue = headers
            .get(http::header::EXPECT)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false);

        Ok(RequestDescriptor {
            method,
            protocol,
            host,
            port,
            use_default_port,
            path,
            socket_path: self.socket_path,
            tls: self.tls,
            headers,
            timeout: self.timeout,
            signal: self.signal,
            max_header_size: self.max_header_size,
            max_headers_count: self.max_headers_count,
            insecure_http_parser: self.insecure_http_parser,
            join_duplicate_headers: self.join_duplicate_headers,
            expect_continue,
        })
    }
}

fn header_name(name: &str) -> Result<HeaderName, Error> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| Error::BadHeader(name.to_string()))
}

fn header_value(value: &str) -> Result<HeaderValue, Error> {
    HeaderValue::from_str(value).map_err(|_| Error::BadHeader(value.to_string()))
}

/// Validated request parameters. Everything the engine needs, nothing it
/// has to re-check.
#[derive(Debug, Clone)]
pub(crate) struct RequestDescriptor {
    pub method: Method,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub use_default_port: bool,
    pub path: String,
    pub socket_path: Option<String>,
    pub tls: TlsOptions,
    pub headers: HeaderMap,
    pub timeout: Option<Duration>,
    pub signal: Option<Signal>,
    pub max_header_size: Option<usize>,
    pub max_headers_count: Option<usize>,
    pub insecure_http_parser: bool,
    pub join_duplicate_headers: bool,
    pub expect_continue: bool,
}

impl RequestDescriptor {
    /// Explicit content-length set by the caller, if any.
    pub fn content_length(&self) -> Result<Option<u64>, Error> {
        let Some(v) = self.headers.get(http::header::CONTENT_LENGTH) else {
            return Ok(None);
        };
        let len = v
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or(Error::BadContentLengthHeader)?;
        Ok(Some(len))
    }

    /// Caller opted into chunked framing explicitly.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get_all(http::header::TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case("chunked"))
    }
}
