use std::fmt;

/// Error type for swoop.
///
/// Construction errors are returned synchronously from [`RequestOptions`]
/// and [`ClientRequest::new`]. Everything that happens after the request
/// started surfaces as [`Event::Error`] instead.
///
/// [`RequestOptions`]: crate::RequestOptions
/// [`ClientRequest::new`]: crate::ClientRequest::new
/// [`Event::Error`]: crate::Event::Error
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Error {
    // construction
    InvalidUrl(String),
    UnsupportedScheme(String),
    InvalidMethod(String),
    UnescapedPath,
    BadHeader(String),
    BadHeaderList(&'static str),

    // transport
    ConnectFailed(String),
    Tls(String),
    ConnectionReset,
    Io(String),

    // protocol
    HttpParseFail(String),
    HttpParseTooManyHeaders,
    HeadersTooLarge,
    ResponseInvalidStatus,
    UnsupportedVersion,
    TooManyContentLengthHeaders,
    BadContentLengthHeader,
    ChunkLenNotAscii,
    ChunkLenNotANumber,
    ChunkExpectedCrLf,
    DuplicateResponse,
    BodyLargerThanContentLength,

    // lifecycle
    WriteAfterEnd,
}

impl From<httparse::Error> for Error {
    fn from(value: httparse::Error) -> Self {
        match value {
            httparse::Error::TooManyHeaders => Error::HttpParseTooManyHeaders,
            e => Error::HttpParseFail(e.to_string()),
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidUrl(v) => write!(f, "invalid url: {}", v),
            Error::UnsupportedScheme(v) => write!(f, "unsupported scheme: {}", v),
            Error::InvalidMethod(v) => write!(f, "method is not a valid http token: {}", v),
            Error::UnescapedPath => write!(f, "request path contains unescaped characters"),
            Error::BadHeader(v) => write!(f, "bad header: {}", v),
            Error::BadHeaderList(v) => write!(f, "bad header list: {}", v),
            Error::ConnectFailed(v) => write!(f, "connect failed: {}", v),
            Error::Tls(v) => write!(f, "tls: {}", v),
            Error::ConnectionReset => write!(f, "connection reset by peer"),
            Error::Io(v) => write!(f, "io: {}", v),
            Error::HttpParseFail(v) => write!(f, "http parse fail: {}", v),
            Error::HttpParseTooManyHeaders => write!(f, "http parse resulted in too many headers"),
            Error::HeadersTooLarge => write!(f, "response headers exceed the maximum header size"),
            Error::ResponseInvalidStatus => write!(f, "http response invalid status"),
            Error::UnsupportedVersion => write!(f, "unsupported http version"),
            Error::TooManyContentLengthHeaders => write!(f, "more than one content-length header"),
            Error::BadContentLengthHeader => write!(f, "content-length header not a number"),
            Error::ChunkLenNotAscii => write!(f, "chunk length is not ascii"),
            Error::ChunkLenNotANumber => write!(f, "chunk length cannot be read as a number"),
            Error::ChunkExpectedCrLf => write!(f, "chunk expected crlf as next character"),
            Error::DuplicateResponse => write!(f, "server sent a second response for the same request"),
            Error::BodyLargerThanContentLength => {
                write!(f, "attempt to write larger body than content-length")
            }
            Error::WriteAfterEnd => write!(f, "write after end"),
        }
    }
}
