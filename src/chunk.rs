use std::str;

use crate::error::Error;

/// Incremental decoder for `transfer-encoding: chunked` response bodies.
///
/// Decoded payload is appended to the caller's output buffer. Trailers are
/// consumed and discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Dechunker {
    state: State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expecting a chunk length line.
    Len,
    /// Inside chunk data, this many bytes left.
    Data(usize),
    /// Expecting the crlf that terminates a chunk.
    DataEnd,
    /// Saw the zero-length chunk, expecting trailers or the final crlf.
    Ending,
    /// Inside a trailer line.
    Trailer,
    /// Fully decoded.
    Ended,
}

// Longest sensible chunk length line. Anything above this is a framing error.
const MAX_LEN_LINE: usize = 20;

impl Dechunker {
    pub fn new() -> Self {
        Dechunker { state: State::Len }
    }

    pub fn is_ended(&self) -> bool {
        self.state == State::Ended
    }

    /// Decode as much of `src` as possible, appending payload to `out`.
    ///
    /// Returns the number of input bytes consumed. Input can be split at
    /// any byte boundary; unconsumed bytes must be offered again.
    pub fn input(&mut self, src: &[u8], out: &mut Vec<u8>) -> Result<usize, Error> {
        let mut consumed = 0;

        loop {
            let rest = &src[consumed..];

            let step = match self.state {
                State::Len => self.read_len(rest)?,
                State::Data(_) => self.read_data(rest, out),
                State::DataEnd => self.expect_crlf(rest)?,
                State::Ending => self.trailer_or_end(rest),
                State::Trailer => self.skip_trailer(rest),
                State::Ended => 0,
            };

            if step == 0 {
                return Ok(consumed);
            }

            consumed += step;
        }
    }

    fn read_len(&mut self, src: &[u8]) -> Result<usize, Error> {
        let Some(i) = find_crlf(src) else {
            if src.len() > MAX_LEN_LINE {
                return Err(Error::ChunkExpectedCrLf);
            }
            return Ok(0);
        };

        if i > MAX_LEN_LINE {
            return Err(Error::ChunkExpectedCrLf);
        }

        // Chunk extensions (";foo=bar") are allowed and ignored.
        let line = &src[..i];
        let len_end = line.iter().position(|c| *c == b';').unwrap_or(i);

        let len_str = str::from_utf8(&line[..len_end])
            .map_err(|_| Error::ChunkLenNotAscii)?
            .trim();

        let len = usize::from_str_radix(len_str, 16).map_err(|_| Error::ChunkLenNotANumber)?;

        self.state = if len == 0 { State::Ending } else { State::Data(len) };

        Ok(i + 2)
    }

    fn read_data(&mut self, src: &[u8], out: &mut Vec<u8>) -> usize {
        let State::Data(left) = &mut self.state else {
            unreachable!()
        };

        let take = src.len().min(*left);
        out.extend_from_slice(&src[..take]);
        *left -= take;

        if *left == 0 {
            self.state = State::DataEnd;
        }

        take
    }

    fn expect_crlf(&mut self, src: &[u8]) -> Result<usize, Error> {
        if src.len() < 2 {
            return Ok(0);
        }

        if &src[..2] != b"\r\n" {
            return Err(Error::ChunkExpectedCrLf);
        }

        self.state = State::Len;

        Ok(2)
    }

    fn trailer_or_end(&mut self, src: &[u8]) -> usize {
        let Some(i) = find_crlf(src) else {
            return 0;
        };

        if i == 0 {
            self.state = State::Ended;
            2
        } else {
            // A trailer line precedes this crlf.
            self.state = State::Trailer;
            self.skip_trailer(src)
        }
    }

    fn skip_trailer(&mut self, src: &[u8]) -> usize {
        let Some(i) = find_crlf(src) else {
            return 0;
        };

        self.state = State::Ending;

        i + 2
    }
}

fn find_crlf(b: &[u8]) -> Option<usize> {
    let cr = b.iter().position(|c| *c == b'\r')?;
    let lf = b.get(cr + 1)?;
    (*lf == b'\n').then_some(cr)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_length_line() -> Result<(), Error> {
        let mut d = Dechunker::new();
        let mut out = Vec::new();
        assert_eq!(d.input(b"", &mut out)?, 0);
        assert_eq!(d.input(b"2", &mut out)?, 0);
        assert_eq!(d.input(b"2\r", &mut out)?, 0);
        assert_eq!(d.input(b"2\r\n", &mut out)?, 3);
        assert!(out.is_empty());
        Ok(())
    }

    #[test]
    fn length_with_extension() -> Result<(), Error> {
        let mut d = Dechunker::new();
        let mut out = Vec::new();
        assert_eq!(d.input(b"2;meta\r", &mut out)?, 0);
        assert_eq!(d.input(b"2;meta\r\nok", &mut out)?, 10);
        assert_eq!(out, b"ok");
        Ok(())
    }

    #[test]
    fn data_across_inputs() -> Result<(), Error> {
        let mut d = Dechunker::new();
        let mut out = Vec::new();
        assert_eq!(d.input(b"5\r\nhel", &mut out)?, 6);
        assert_eq!(d.input(b"lo\r\n", &mut out)?, 4);
        assert_eq!(out, b"hello");
        assert!(!d.is_ended());
        assert_eq!(d.input(b"0\r\n\r\n", &mut out)?, 5);
        assert!(d.is_ended());
        Ok(())
    }

    #[test]
    fn several_chunks_one_input() -> Result<(), Error> {
        let mut d = Dechunker::new();
        let mut out = Vec::new();
        let n = d.input(b"4\r\ndata\r\n4\r\nmoar\r\n0\r\n\r\n", &mut out)?;
        assert_eq!(n, 23);
        assert_eq!(out, b"datamoar");
        assert!(d.is_ended());
        Ok(())
    }

    #[test]
    fn trailers_are_discarded() -> Result<(), Error> {
        let mut d = Dechunker::new();
        let mut out = Vec::new();
        let input = b"2\r\nok\r\n0\r\nx-check: 1\r\n\r\n";
        assert_eq!(d.input(input, &mut out)?, input.len());
        assert_eq!(out, b"ok");
        assert!(d.is_ended());
        Ok(())
    }

    #[test]
    fn bad_length_is_an_error() {
        let mut d = Dechunker::new();
        let mut out = Vec::new();
        assert_eq!(d.input(b"zz\r\n", &mut out), Err(Error::ChunkLenNotANumber));
    }

    #[test]
    fn runaway_length_line_is_an_error() {
        let mut d = Dechunker::new();
        let mut out = Vec::new();
        let input = [b'1'; MAX_LEN_LINE + 2];
        assert_eq!(d.input(&input, &mut out), Err(Error::ChunkExpectedCrLf));
    }
}
