use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;

use crate::format::Format;
use crate::parser::{BoundaryParser, ParseResult};
use crate::part::{Part, PartBody, PartHeaders};
use crate::record::{Content, DocumentRecord, Metadata, ReadEvent};
use crate::{Error, HeaderMap, Result, Session};

/// Default initial buffer capacity
pub const DEFAULT_BUFFER_CAP: usize = 35000;

pub trait MultipartResponse<S>
where
    Self: Sized,
{
    /// Turns a response into a stream of read events, failing fast when the
    /// response is not a non-empty `multipart/mixed` body.
    fn into_documents(self, session: &Session) -> Result<MultipartReader<S>>;
}

impl<S> MultipartResponse<S> for http::Response<S> {
    fn into_documents(self, session: &Session) -> Result<MultipartReader<S>> {
        let (parts, body) = self.into_parts();
        MultipartReader::from_headers(session, &parts.headers, body)
    }
}

/// Checks that the headers describe a multipart/mixed body framed with the
/// session boundary.
pub(crate) fn validate(session: &Session, headers: &impl HeaderMap) -> Result<()> {
    if let Some(len) = headers.get_value("content-length") {
        if len.trim().parse::<u64>().ok() == Some(0) {
            return Err(Error::EmptyBody);
        }
    }

    let ct: mime::Mime = headers
        .get_value("content-type")
        .ok_or(Error::ContentTypeMissing)?
        .parse()?;

    if ct.type_() != mime::MULTIPART || ct.subtype().as_str() != "mixed" {
        return Err(Error::NotMultipart);
    }

    match ct.get_param(mime::BOUNDARY) {
        Some(b) if b.as_str() != session.boundary() => Err(Error::malformed(format!(
            "response boundary {:?} does not match session boundary {:?}",
            b.as_str(),
            session.boundary()
        ))),
        _ => Ok(()),
    }
}

/// Metadata waiting for the content part of the same document.
#[derive(Debug)]
struct Pending {
    uri: Option<String>,
    metadata: Metadata,
}

impl Pending {
    fn into_record(self) -> DocumentRecord {
        DocumentRecord {
            uri: self.uri,
            format: Format::None,
            content_type: None,
            content: None,
            metadata: Some(self.metadata),
        }
    }
}

/// Reads documents out of a multipart/mixed byte stream.
///
/// Metadata parts are held until the part that follows them shows whether it
/// is the content of the same document, in which case both are merged into
/// one record. Records are emitted in wire order.
pub struct MultipartReader<S> {
    inner: Pin<Box<S>>,
    parser: BoundaryParser,
    part: Option<Part>,
    pending: Option<Pending>,
    seen_content: HashSet<String>,
    queue: VecDeque<ReadEvent>,
    inner_done: bool,
    finished: bool,
}

impl<S> MultipartReader<S> {
    pub fn from_headers(session: &Session, headers: &impl HeaderMap, inner: S) -> Result<Self> {
        validate(session, headers)?;
        Ok(Self::new(session, inner))
    }

    /// Creates a reader without looking at any response headers.
    pub fn new(session: &Session, inner: S) -> Self {
        Self {
            inner: Box::pin(inner),
            parser: BoundaryParser::with_capacity(
                session.boundary(),
                session.get_buffer_capacity(),
            ),
            part: None,
            pending: None,
            seen_content: HashSet::new(),
            queue: VecDeque::new(),
            inner_done: false,
            finished: false,
        }
    }

    /// Gives back the underlying byte stream, e.g. to drain it.
    pub fn into_inner(self) -> Pin<Box<S>> {
        self.inner
    }

    fn handle(&mut self, result: ParseResult) -> Result<()> {
        match result {
            ParseResult::Headers(raw) => self.begin_part(&raw),
            ParseResult::Body(bytes) => self.on_body(bytes),
            ParseResult::PartEnd => self.end_part(),
            ParseResult::Done => {
                self.flush_pending();
                self.finished = true;
                Ok(())
            }
            ParseResult::Err(e) => Err(e),
            ParseResult::NotReady => Ok(()),
        }
    }

    fn begin_part(&mut self, raw: &[u8]) -> Result<()> {
        if self.part.is_some() {
            return Err(Error::malformed("part headers before the previous part ended"));
        }

        let headers = PartHeaders::parse(raw)?;
        self.part = Some(Part::classify(headers));
        Ok(())
    }

    fn on_body(&mut self, bytes: Bytes) -> Result<()> {
        let mut part = self
            .part
            .take()
            .ok_or_else(|| Error::malformed("body bytes outside of a part"))?;

        match part.body {
            PartBody::Text(ref mut buf) => buf.extend_from_slice(&bytes),
            PartBody::Binary { ref mut started } => {
                if !*started {
                    *started = true;
                    self.start_binary(&part.headers)?;
                }
                if !bytes.is_empty() {
                    self.queue.push_back(ReadEvent::BinaryChunk(bytes));
                }
            }
        }

        self.part = Some(part);
        Ok(())
    }

    fn end_part(&mut self) -> Result<()> {
        let part = self
            .part
            .take()
            .ok_or_else(|| Error::malformed("part ended before it started"))?;

        match part.body {
            PartBody::Binary { started } => {
                if !started {
                    self.start_binary(&part.headers)?;
                }
                self.queue.push_back(ReadEvent::BinaryEnd);
                Ok(())
            }
            PartBody::Text(buf) => self.finish_text(part.headers, buf.freeze()),
        }
    }

    fn start_binary(&mut self, headers: &PartHeaders) -> Result<()> {
        self.check_duplicate(headers.uri.as_deref())?;

        let mut record = DocumentRecord {
            uri: headers.uri.clone(),
            format: headers.format(),
            content_type: headers.declared_type(),
            content: None,
            metadata: None,
        };
        self.correlate(&mut record);
        self.queue.push_back(ReadEvent::BinaryStart(record));
        Ok(())
    }

    fn finish_text(&mut self, headers: PartHeaders, body: Bytes) -> Result<()> {
        if headers.is_metadata() {
            if headers.content_type.is_some() && headers.format() != Format::Json {
                return Err(Error::malformed(format!(
                    "metadata for {:?} is not json: {:?}",
                    headers.uri, headers.content_type
                )));
            }
            let metadata: Metadata = serde_json::from_slice(&body)?;
            return self.hold(headers.uri, metadata);
        }

        let format = headers.format();
        let content = match format {
            Format::Json => Content::Json(serde_json::from_slice(&body)?),
            Format::Xml | Format::Text => Content::Text(decode(body)?),
            Format::Binary | Format::None => Content::Binary(body),
        };

        if headers.is_value() {
            self.flush_pending();

            let value = match content {
                Content::Json(v) => v,
                Content::Text(s) => serde_json::Value::String(s),
                Content::Binary(b) => {
                    serde_json::Value::String(String::from_utf8_lossy(&b).into_owned())
                }
            };
            self.queue.push_back(ReadEvent::Summary(value));
            return Ok(());
        }

        self.check_duplicate(headers.uri.as_deref())?;

        let mut record = DocumentRecord {
            uri: headers.uri.clone(),
            format,
            content_type: headers.declared_type(),
            content: Some(content),
            metadata: None,
        };
        self.correlate(&mut record);
        self.queue.push_back(ReadEvent::Document(record));
        Ok(())
    }

    /// Holds metadata as pending, flushing a pending entry for another
    /// document first.
    fn hold(&mut self, uri: Option<String>, metadata: Metadata) -> Result<()> {
        if let Some(prev) = self.pending.take() {
            if prev.uri == uri {
                return Err(Error::malformed(format!(
                    "two metadata parts for {:?} without content in between",
                    uri
                )));
            }
            log::debug!("Flushing metadata for {:?}", prev.uri);
            self.queue.push_back(ReadEvent::Document(prev.into_record()));
        }

        self.pending = Some(Pending { uri, metadata });
        Ok(())
    }

    /// Merges pending metadata of the same document into `record`, or flushes
    /// it on its own when it belongs to another document.
    fn correlate(&mut self, record: &mut DocumentRecord) {
        if let Some(pending) = self.pending.take() {
            if pending.uri == record.uri {
                log::debug!("Merging metadata into {:?}", record.uri);
                record.metadata = Some(pending.metadata);
            } else {
                log::debug!("Flushing metadata for {:?}", pending.uri);
                self.queue.push_back(ReadEvent::Document(pending.into_record()));
            }
        }
    }

    fn flush_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            log::debug!("Flushing metadata for {:?}", pending.uri);
            self.queue.push_back(ReadEvent::Document(pending.into_record()));
        }
    }

    fn check_duplicate(&mut self, uri: Option<&str>) -> Result<()> {
        match uri {
            Some(uri) if !self.seen_content.insert(uri.to_string()) => Err(Error::malformed(
                format!("two content parts for {}", uri),
            )),
            _ => Ok(()),
        }
    }

    fn fail(&mut self, e: Error) -> Poll<Option<Result<ReadEvent>>> {
        self.finished = true;
        self.queue.clear();
        self.part = None;
        self.pending = None;
        Poll::Ready(Some(Err(e)))
    }
}

fn decode(body: Bytes) -> Result<String> {
    String::from_utf8(body.to_vec())
        .map_err(|e| Error::malformed(format!("text part is not valid utf-8: {}", e)))
}

impl<S, B, E> Stream for MultipartReader<S>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    type Item = Result<ReadEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(event) = this.queue.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }

            if this.finished {
                return Poll::Ready(None);
            }

            let result = match this.parser.parse() {
                ParseResult::NotReady if this.inner_done => this.parser.finish(),
                ParseResult::NotReady => {
                    match this.inner.as_mut().poll_next(cx) {
                        Poll::Ready(Some(Ok(chunk))) => this.parser.push(chunk),
                        Poll::Ready(Some(Err(e))) => return this.fail(Error::inner(e)),
                        Poll::Ready(None) => this.inner_done = true,
                        Poll::Pending => return Poll::Pending,
                    }
                    continue;
                }
                other => other,
            };

            if let Err(e) = this.handle(result) {
                return this.fail(e);
            }
        }
    }
}
