use crate::Error;
use bytes::{Buf, Bytes, BytesMut};

const CRLF: &[u8] = b"\r\n";
const BOUNDARY_LAST_PART_SENTINEL: &[u8] = b"--";

#[derive(Debug)]
pub(crate) enum ParseResult {
    Done,
    NotReady,
    /// Raw header block of a new part.
    Headers(Bytes),
    /// A slice of the current part's body.
    Body(Bytes),
    PartEnd,
    Err(Error),
}

#[cfg(test)]
impl std::cmp::PartialEq for ParseResult {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ParseResult::Done, ParseResult::Done) => true,
            (ParseResult::NotReady, ParseResult::NotReady) => true,
            (ParseResult::PartEnd, ParseResult::PartEnd) => true,
            (ParseResult::Err(_), ParseResult::Err(_)) => false,
            (ParseResult::Headers(ref bs), ParseResult::Headers(ref other_bs)) => bs == other_bs,
            (ParseResult::Body(ref bs), ParseResult::Body(ref other_bs)) => bs == other_bs,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Preamble,
    Headers,
    Body,
    Epilogue,
}

/// Splits a multipart body into header blocks and body slices without
/// buffering whole parts.
///
/// A part body ends at CRLF followed by `--boundary`, which is in turn
/// followed by either CRLF (another part) or `--` (the last part).
#[derive(Debug)]
pub(crate) struct BoundaryParser {
    // "\r\n--boundary"
    delimiter: Vec<u8>,
    buffer: BytesMut,
    state: State,
}

impl BoundaryParser {
    pub fn with_capacity<S: AsRef<str>>(boundary: S, capacity: usize) -> Self {
        let delimiter = format!("\r\n--{}", boundary.as_ref()).into_bytes();

        log::debug!("Creating with delimiter: {:?}", String::from_utf8_lossy(&delimiter));

        Self {
            delimiter,
            buffer: BytesMut::with_capacity(capacity),
            state: State::Preamble,
        }
    }

    pub fn push<T: AsRef<[u8]>>(&mut self, chunk: T) {
        if self.state == State::Epilogue {
            return;
        }
        self.buffer.extend_from_slice(chunk.as_ref());
    }

    /// Returns the next event available in the buffered input.
    pub fn parse(&mut self) -> ParseResult {
        match self.state {
            State::Preamble => self.parse_preamble(),
            State::Headers => self.parse_headers(),
            State::Body => self.parse_body(),
            State::Epilogue => {
                self.buffer.clear();
                ParseResult::Done
            }
        }
    }

    /// Called once the input is exhausted and `parse` returned `NotReady`.
    pub fn finish(&mut self) -> ParseResult {
        match self.state {
            State::Epilogue => ParseResult::Done,
            State::Preamble => ParseResult::Err(Error::malformed("missing boundary")),
            _ => ParseResult::Err(Error::malformed(
                "body ended before the closing boundary",
            )),
        }
    }

    fn parse_preamble(&mut self) -> ParseResult {
        // The first boundary may open the body without a leading CRLF.
        let dash_len = self.delimiter.len() - 2;

        let start = if self.buffer.starts_with(&self.delimiter[2..]) {
            Some(0)
        } else {
            twoway::find_bytes(&self.buffer, &self.delimiter).map(|i| i + 2)
        };

        match start {
            Some(i) => {
                self.buffer.advance(i);
                self.after_boundary(dash_len)
            }
            None => {
                // Preamble is to be discarded, keep what might be a partial boundary.
                let keep = self.delimiter.len() - 1;
                if self.buffer.len() > keep {
                    let n = self.buffer.len() - keep;
                    self.buffer.advance(n);
                }
                ParseResult::NotReady
            }
        }
    }

    fn parse_headers(&mut self) -> ParseResult {
        if self.buffer.len() < 2 {
            return ParseResult::NotReady;
        }

        // No headers, the body starts right away.
        if self.buffer.starts_with(CRLF) {
            self.buffer.advance(2);
            self.state = State::Body;
            return ParseResult::Headers(Bytes::new());
        }

        match twoway::find_bytes(&self.buffer, b"\r\n\r\n") {
            Some(p) => {
                let headers = self.buffer.split_to(p).freeze();
                self.buffer.advance(4);
                self.state = State::Body;
                log::trace!("Part headers: {:?}", String::from_utf8_lossy(&headers));
                ParseResult::Headers(headers)
            }
            None => ParseResult::NotReady,
        }
    }

    fn parse_body(&mut self) -> ParseResult {
        match twoway::find_bytes(&self.buffer, &self.delimiter) {
            Some(0) => {
                let n = self.delimiter.len();
                self.after_boundary(n)
            }
            Some(i) => ParseResult::Body(self.buffer.split_to(i).freeze()),
            None => {
                // Everything but a possible partial delimiter is body.
                let keep = self.delimiter.len() - 1;
                if self.buffer.len() > keep {
                    let n = self.buffer.len() - keep;
                    ParseResult::Body(self.buffer.split_to(n).freeze())
                } else {
                    ParseResult::NotReady
                }
            }
        }
    }

    /// The buffer starts with a boundary of `len` bytes, decide what follows it.
    fn after_boundary(&mut self, len: usize) -> ParseResult {
        if self.buffer.len() < len + 2 {
            return ParseResult::NotReady;
        }

        let in_body = self.state == State::Body;

        // the next two bytes are either CRLF or --.
        let next = [self.buffer[len], self.buffer[len + 1]];
        match &next[..] {
            CRLF => {
                self.buffer.advance(len + 2);
                self.state = State::Headers;
            }

            BOUNDARY_LAST_PART_SENTINEL => {
                log::debug!("Found stop sentinel");
                self.buffer.clear();
                self.state = State::Epilogue;
            }

            slice => {
                return ParseResult::Err(Error::malformed(format!(
                    "Boundary must be followed by `--` or `\r\n`, found: {:?}",
                    slice
                )));
            }
        }

        if in_body {
            ParseResult::PartEnd
        } else {
            self.parse()
        }
    }
}
