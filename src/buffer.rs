use std::borrow::Cow;
use std::collections::VecDeque;

/// Threshold at which [`ClientRequest::write`] starts returning `false`.
///
/// The buffer has no real capacity limit. The threshold exists so that
/// callers looping "until backpressure" eventually stop; flushing happens
/// synchronously once the transport is open, so the value says nothing
/// about actual transport capacity.
///
/// [`ClientRequest::write`]: crate::ClientRequest::write
pub const MAX_FAKE_BACKPRESSURE: usize = 1024 * 1024;

/// Text encoding for string payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Latin1,
}

/// A body chunk passed to [`write()`][crate::ClientRequest::write].
///
/// Byte payloads and utf-8 text are used as-is without copying. Latin-1
/// text is re-encoded byte per byte, keeping the low byte of characters
/// outside the latin-1 range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload<'a> {
    Bytes(&'a [u8]),
    Text(&'a str, TextEncoding),
}

impl<'a> Payload<'a> {
    pub(crate) fn into_bytes(self) -> Cow<'a, [u8]> {
        match self {
            Payload::Bytes(b) => Cow::Borrowed(b),
            Payload::Text(s, TextEncoding::Utf8) => Cow::Borrowed(s.as_bytes()),
            Payload::Text(s, TextEncoding::Latin1) => {
                Cow::Owned(s.chars().map(|c| (c as u32 & 0xff) as u8).collect())
            }
        }
    }
}

impl<'a> From<&'a [u8]> for Payload<'a> {
    fn from(value: &'a [u8]) -> Self {
        Payload::Bytes(value)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Payload<'a> {
    fn from(value: &'a [u8; N]) -> Self {
        Payload::Bytes(value)
    }
}

impl<'a> From<&'a str> for Payload<'a> {
    fn from(value: &'a str) -> Self {
        Payload::Text(value, TextEncoding::Utf8)
    }
}

impl<'a> From<&'a Vec<u8>> for Payload<'a> {
    fn from(value: &'a Vec<u8>) -> Self {
        Payload::Bytes(value)
    }
}

/// Ordered body chunks waiting for the transport to open.
#[derive(Debug, Default)]
pub(crate) struct BodyBuffer {
    chunks: VecDeque<Vec<u8>>,
    total: usize,
}

impl BodyBuffer {
    pub fn new() -> Self {
        BodyBuffer::default()
    }

    /// Append a chunk. Returns `false` once the cumulative buffered size,
    /// including this chunk, reaches [`MAX_FAKE_BACKPRESSURE`].
    pub fn push(&mut self, chunk: Vec<u8>) -> bool {
        self.total += chunk.len();
        self.chunks.push_back(chunk);
        self.total < MAX_FAKE_BACKPRESSURE
    }

    /// Take all buffered chunks, in the order they were written.
    pub fn take(&mut self) -> VecDeque<Vec<u8>> {
        self.total = 0;
        std::mem::take(&mut self.chunks)
    }

    pub fn total(&self) -> usize {
        self.total
    }
}
