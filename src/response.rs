//! Delivery of read results, either as a live stream or as one buffered value.
//!
//! Responding to an operation spawns a task that reads the response body and
//! feeds a bounded channel. The returned [`ResponseHandle`] is consumed by
//! whichever of [`ResponseHandle::stream`] or [`ResponseHandle::result`] is
//! called first, so a record can never reach both. A handle dropped without
//! either still has its response drained so the connection is not left half
//! read.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http::StatusCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::format::{resolve_format, Format};
use crate::multipart::{validate, MultipartReader};
use crate::record::{Content, DocumentRecord, ReadEvent, Record};
use crate::{Error, HeaderMap, Result, Session};

/// Most bytes of a rejected response's body kept in [`Error::Status`].
pub const MAX_ERROR_BODY: usize = 8 * 1024;

/// What an operation accepts from the server.
#[derive(Debug, Clone)]
pub struct Operation {
    name: String,
    allowed: Vec<StatusCode>,
    require_documents: bool,
}

impl Operation {
    /// An operation accepting `200 OK` only.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Operation {
            name: name.into(),
            allowed: vec![StatusCode::OK],
            require_documents: false,
        }
    }

    pub fn allow_status(mut self, status: StatusCode) -> Self {
        if !self.allowed.contains(&status) {
            self.allowed.push(status);
        }
        self
    }

    /// Replaces the accepted statuses.
    pub fn allowed_statuses(mut self, statuses: &[StatusCode]) -> Self {
        self.allowed = statuses.to_vec();
        self
    }

    /// When set, a non-empty response that is not multipart/mixed is an error
    /// instead of a single value.
    pub fn require_documents(mut self, required: bool) -> Self {
        self.require_documents = required;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accepts(&self, status: StatusCode) -> bool {
        self.allowed.contains(&status)
    }

    /// Starts delivering `response`. Must be called from within a tokio runtime.
    pub fn respond<S, B, E>(&self, session: &Session, response: http::Response<S>) -> ResponseHandle
    where
        S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let (parts, body) = response.into_parts();
        self.respond_parts(session, parts.status, &parts.headers, body)
    }

    pub fn respond_parts<S, B, E>(
        &self,
        session: &Session,
        status: StatusCode,
        headers: &impl HeaderMap,
        body: S,
    ) -> ResponseHandle
    where
        S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let route = self.route(session, status, headers);
        let (tx, rx) = mpsc::channel(session.get_channel_capacity());

        let task = tokio::spawn(drive(route, body, tx));

        ResponseHandle {
            rx,
            canceller: Canceller {
                inner: Arc::new(CancelState {
                    operation: self.name.clone(),
                    cancelled: AtomicBool::new(false),
                    task,
                }),
            },
        }
    }

    fn route(&self, session: &Session, status: StatusCode, headers: &impl HeaderMap) -> Route {
        if !self.accepts(status) {
            log::debug!("{}: rejecting response with status {}", self.name, status);
            return Route::Rejected(status);
        }

        if status == StatusCode::NO_CONTENT {
            return Route::Empty;
        }

        match validate(session, headers) {
            Ok(()) => Route::Multipart(session.clone()),
            Err(Error::EmptyBody) => Route::Empty,
            Err(Error::NotMultipart) | Err(Error::ContentTypeMissing)
                if !self.require_documents =>
            {
                let content_type = headers.get_value("content-type").map(str::to_string);
                Route::Single {
                    format: resolve_format(content_type.as_deref()),
                    content_type,
                }
            }
            Err(e) => Route::Failed(e),
        }
    }
}

enum Route {
    Rejected(StatusCode),
    Failed(Error),
    Empty,
    Multipart(Session),
    Single {
        format: Format,
        content_type: Option<String>,
    },
}

#[derive(Debug)]
enum Signal {
    Event(ReadEvent),
    Error(Error),
    End,
}

async fn drive<S, B, E>(route: Route, body: S, tx: mpsc::Sender<Signal>)
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    let mut source = match route {
        Route::Rejected(status) => {
            let err = match collect_capped(Box::pin(body), MAX_ERROR_BODY).await {
                Ok(body) => Error::status(status, &body),
                Err(e) => e,
            };
            let _ = tx.send(Signal::Error(err)).await;
            return;
        }
        Route::Failed(e) => {
            let _ = tx.send(Signal::Error(e)).await;
            drain(Box::pin(body)).await;
            return;
        }
        Route::Empty => Source::Empty(Box::pin(body)),
        Route::Multipart(session) => Source::Multipart(MultipartReader::new(&session, body)),
        Route::Single {
            format,
            content_type,
        } => Source::Single(PassThrough {
            inner: Box::pin(body),
            format,
            content_type,
            buffer: BytesMut::new(),
            done: false,
        }),
    };

    while let Some(item) = source.next().await {
        let (signal, fatal) = match item {
            Ok(event) => (Signal::Event(event), false),
            Err(e) => (Signal::Error(e), true),
        };

        if tx.send(signal).await.is_err() {
            log::debug!("No consumer attached, draining response");
            drain(source.into_inner()).await;
            return;
        }

        if fatal {
            return;
        }
    }

    let _ = tx.send(Signal::End).await;
}

/// Keeps at most `limit` bytes of the body, reading the rest to the end.
async fn collect_capped<S, B, E>(mut body: Pin<Box<S>>, limit: usize) -> Result<Bytes>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(Error::inner)?;
        let chunk = chunk.as_ref();
        let room = limit.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
    Ok(buf.freeze())
}

async fn drain<S, B, E>(mut body: Pin<Box<S>>)
where
    S: Stream<Item = std::result::Result<B, E>>,
{
    while let Some(chunk) = body.next().await {
        if chunk.is_err() {
            break;
        }
    }
}

enum Source<S> {
    Empty(Pin<Box<S>>),
    Multipart(MultipartReader<S>),
    Single(PassThrough<S>),
}

impl<S> Source<S> {
    fn into_inner(self) -> Pin<Box<S>> {
        match self {
            Source::Empty(inner) => inner,
            Source::Multipart(reader) => reader.into_inner(),
            Source::Single(single) => single.inner,
        }
    }
}

impl<S, B, E> Stream for Source<S>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    type Item = Result<ReadEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            Source::Empty(inner) => loop {
                match inner.as_mut().poll_next(cx) {
                    Poll::Ready(Some(Ok(_))) => continue,
                    Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(Error::inner(e)))),
                    Poll::Ready(None) => return Poll::Ready(None),
                    Poll::Pending => return Poll::Pending,
                }
            },
            Source::Multipart(reader) => Pin::new(reader).poll_next(cx),
            Source::Single(single) => Pin::new(single).poll_next(cx),
        }
    }
}

/// A response that is not multipart, delivered as one value.
struct PassThrough<S> {
    inner: Pin<Box<S>>,
    format: Format,
    content_type: Option<String>,
    buffer: BytesMut,
    done: bool,
}

impl<S> PassThrough<S> {
    fn decode(&mut self) -> Result<Option<ReadEvent>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let body = self.buffer.split().freeze();
        let event = match self.format {
            Format::Json => ReadEvent::Summary(serde_json::from_slice(&body)?),
            Format::Xml | Format::Text => ReadEvent::Summary(serde_json::Value::String(
                String::from_utf8(body.to_vec())
                    .map_err(|e| Error::malformed(format!("body is not valid utf-8: {}", e)))?,
            )),
            Format::Binary | Format::None => ReadEvent::Document(DocumentRecord {
                uri: None,
                format: Format::Binary,
                content_type: self
                    .content_type
                    .as_deref()
                    .and_then(|ct| ct.split(';').next())
                    .map(|s| s.trim().to_string()),
                content: Some(Content::Binary(body)),
                metadata: None,
            }),
        };

        Ok(Some(event))
    }
}

impl<S, B, E> Stream for PassThrough<S>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    type Item = Result<ReadEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.done {
            return Poll::Ready(None);
        }

        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.buffer.extend_from_slice(chunk.as_ref()),
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(Error::inner(e))));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(this.decode().transpose());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[derive(Debug)]
struct CancelState {
    operation: String,
    cancelled: AtomicBool,
    task: JoinHandle<()>,
}

/// Cancels an in-flight read. Cloned freely, cancels at most once.
#[derive(Debug, Clone)]
pub struct Canceller {
    inner: Arc<CancelState>,
}

impl Canceller {
    /// Aborts the reading task, which closes the response body. Any consumer
    /// sees [`Error::Cancelled`] exactly once and nothing after it.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            log::debug!("{}: cancelled", self.inner.operation);
            self.inner.task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

/// The consumer facing side of an operation's response.
#[derive(Debug)]
pub struct ResponseHandle {
    rx: mpsc::Receiver<Signal>,
    canceller: Canceller,
}

impl ResponseHandle {
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    pub fn cancel(&self) {
        self.canceller.cancel()
    }

    /// Delivers events as they are read.
    pub fn stream(self) -> RecordStream {
        RecordStream {
            rx: self.rx,
            canceller: self.canceller,
            done: false,
        }
    }

    /// Buffers every record, in wire order, and resolves once the response
    /// is complete. Binary content is reassembled into its record.
    pub async fn result(self) -> Result<Vec<Record>> {
        let mut stream = self.stream();
        let mut collector = Collector::default();

        while let Some(event) = stream.next().await {
            collector.push(event?)?;
        }

        collector.finish()
    }

    /// Like [`result`](ResponseHandle::result), for operations answering with
    /// a single value.
    pub async fn single(self) -> Result<Option<Record>> {
        Ok(self.result().await?.into_iter().next())
    }

    /// The buffered documents, leaving out summaries.
    pub async fn documents(self) -> Result<Vec<DocumentRecord>> {
        Ok(self
            .result()
            .await?
            .into_iter()
            .filter_map(Record::into_document)
            .collect())
    }
}

/// Read events of one response, in wire order.
///
/// Ends after an error, after cancellation, or once the response is complete.
#[derive(Debug)]
pub struct RecordStream {
    rx: mpsc::Receiver<Signal>,
    canceller: Canceller,
    done: bool,
}

impl RecordStream {
    pub fn cancel(&self) {
        self.canceller.cancel()
    }
}

impl Stream for RecordStream {
    type Item = Result<ReadEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        if self.canceller.is_cancelled() {
            self.done = true;
            self.rx.close();
            return Poll::Ready(Some(Err(Error::Cancelled)));
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Signal::Event(event))) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(Some(Signal::Error(e))) => {
                self.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(Some(Signal::End)) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                self.done = true;
                if self.canceller.is_cancelled() {
                    Poll::Ready(Some(Err(Error::Cancelled)))
                } else {
                    Poll::Ready(Some(Err(Error::ConnectionClosed)))
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Folds read events into records.
#[derive(Debug, Default)]
struct Collector {
    records: Vec<Record>,
    binary: Option<(DocumentRecord, BytesMut)>,
}

impl Collector {
    fn push(&mut self, event: ReadEvent) -> Result<()> {
        match event {
            ReadEvent::Document(d) => self.records.push(Record::Document(d)),
            ReadEvent::Summary(v) => self.records.push(Record::Summary(v)),
            ReadEvent::BinaryStart(d) => {
                if self.binary.is_some() {
                    return Err(Error::malformed("binary part started inside another"));
                }
                self.binary = Some((d, BytesMut::new()));
            }
            ReadEvent::BinaryChunk(chunk) => match self.binary {
                Some((_, ref mut buf)) => buf.extend_from_slice(&chunk),
                None => return Err(Error::malformed("binary chunk outside of a part")),
            },
            ReadEvent::BinaryEnd => {
                let (mut record, buf) = self
                    .binary
                    .take()
                    .ok_or_else(|| Error::malformed("binary part ended before it started"))?;
                record.content = Some(Content::Binary(buf.freeze()));
                self.records.push(Record::Document(record));
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<Vec<Record>> {
        if self.binary.is_some() {
            return Err(Error::malformed("response ended inside a binary part"));
        }
        Ok(self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;

    fn session() -> Session {
        Session::with_boundary("BOUND").unwrap()
    }

    const MULTIPART: &str = "multipart/mixed; boundary=BOUND";

    type Chunk = std::result::Result<Bytes, Error>;

    fn response(
        status: u16,
        content_type: &str,
        body: &str,
    ) -> http::Response<stream::Iter<std::vec::IntoIter<Chunk>>> {
        let chunks: Vec<Chunk> = body
            .as_bytes()
            .chunks(5)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        http::Response::builder()
            .status(status)
            .header("content-type", content_type)
            .body(stream::iter(chunks))
            .unwrap()
    }

    const TWO_DOCS: &str = "--BOUND\r\n\
Content-Type: application/json\r\n\
Content-Disposition: attachment; filename=\"/a.json\"; category=content\r\n\
\r\n\
{\"a\":1}\r\n\
--BOUND\r\n\
Content-Type: application/octet-stream\r\n\
Content-Disposition: attachment; filename=\"/b.bin\"; category=content\r\n\
\r\n\
0123456789\r\n\
--BOUND--\r\n";

    #[tokio::test]
    async fn result_buffers_records_in_order() {
        let op = Operation::new("read");
        let handle = op.respond(&session(), response(200, MULTIPART, TWO_DOCS));

        let records = handle.result().await.unwrap();
        assert_eq!(2, records.len());

        let a = records[0].as_document().unwrap();
        assert_eq!(Some("/a.json"), a.uri.as_deref());
        assert_eq!(Some(&Content::Json(json!({"a": 1}))), a.content.as_ref());

        let b = records[1].as_document().unwrap();
        assert_eq!(Some("/b.bin"), b.uri.as_deref());
        assert_eq!(Some(&b"0123456789"[..]), b.content.as_ref().and_then(Content::as_bytes));
    }

    #[tokio::test]
    async fn stream_delivers_events_without_buffering() {
        let op = Operation::new("read");
        let stream = op
            .respond(&session(), response(200, MULTIPART, TWO_DOCS))
            .stream();

        let events: Vec<ReadEvent> = stream.map(|e| e.unwrap()).collect().await;

        assert!(matches!(events[0], ReadEvent::Document(_)));
        assert!(matches!(events[1], ReadEvent::BinaryStart(_)));
        assert_eq!(Some(&ReadEvent::BinaryEnd), events.last());
    }

    #[tokio::test]
    async fn rejected_status_carries_code_and_body() {
        let op = Operation::new("read");

        // Body parses as multipart, the status still wins.
        let handle = op.respond(&session(), response(500, MULTIPART, TWO_DOCS));
        let err = handle.result().await.unwrap_err();
        assert!(err.is_status());
        assert_eq!(Some(StatusCode::INTERNAL_SERVER_ERROR), err.status_code());

        let handle = op.respond(
            &session(),
            response(
                404,
                "application/json",
                r#"{"errorResponse":{"messageCode":"RESTAPI-NODOCUMENT"}}"#,
            ),
        );
        let mut stream = handle.stream();
        match stream.next().await {
            Some(Err(Error::Status { status, body: Some(body) })) => {
                assert_eq!(StatusCode::NOT_FOUND, status);
                assert_eq!("RESTAPI-NODOCUMENT", body["errorResponse"]["messageCode"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn rejected_body_is_capped_and_drained() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let chunk = Bytes::from(vec![b'x'; 1000]);

        let body = stream::iter((0..100).map(move |_| Ok::<_, Error>(chunk.clone()))).chain(
            stream::once(async move {
                let _ = tx.send(());
                Ok(Bytes::new())
            }),
        );

        let mut headers = http::HeaderMap::new();
        headers.insert("content-type", "text/plain".parse().unwrap());

        let err = Operation::new("read")
            .respond_parts(&session(), StatusCode::BAD_GATEWAY, &headers, body)
            .result()
            .await
            .unwrap_err();

        match err {
            Error::Status {
                status,
                body: Some(serde_json::Value::String(text)),
            } => {
                assert_eq!(StatusCode::BAD_GATEWAY, status);
                assert_eq!(MAX_ERROR_BODY, text.len());
            }
            other => panic!("unexpected {:?}", other),
        }

        // The error only went out after the whole body was read.
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn allowed_statuses_are_configurable() {
        let op = Operation::new("write")
            .allowed_statuses(&[StatusCode::CREATED, StatusCode::NO_CONTENT]);
        assert!(!op.accepts(StatusCode::OK));

        let ack = r#"{"documents":[{"uri":"/a.json"}]}"#;
        let handle = op.respond(&session(), response(201, "application/json", ack));
        let ack = handle.single().await.unwrap();
        assert_eq!(
            Some(Record::Summary(json!({"documents": [{"uri": "/a.json"}]}))),
            ack
        );

        let handle = op.respond(&session(), response(204, "text/plain", ""));
        assert_eq!(None, handle.single().await.unwrap());
    }

    #[tokio::test]
    async fn non_multipart_is_a_single_value_unless_documents_are_required() {
        let handle =
            Operation::new("read").respond(&session(), response(200, "text/plain", "hello"));
        assert_eq!(
            vec![Record::Summary(json!("hello"))],
            handle.result().await.unwrap()
        );

        let handle = Operation::new("read")
            .require_documents(true)
            .respond(&session(), response(200, "text/plain", "hello"));
        assert!(matches!(handle.result().await, Err(Error::NotMultipart)));
    }

    #[tokio::test]
    async fn empty_multipart_response_has_no_records() {
        let mut headers = http::HeaderMap::new();
        headers.insert("content-type", MULTIPART.parse().unwrap());
        headers.insert("content-length", "0".parse().unwrap());

        let body = stream::iter(Vec::<Chunk>::new());
        let handle = Operation::new("read")
            .require_documents(true)
            .respond_parts(&session(), StatusCode::OK, &headers, body);

        assert!(handle.result().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_rejects_once_and_stops_delivery() {
        // A body that never ends.
        let body = stream::iter(vec![Ok::<_, Error>(Bytes::from_static(b"--BOUND\r\n"))])
            .chain(stream::pending());

        let mut headers = http::HeaderMap::new();
        headers.insert("content-type", MULTIPART.parse().unwrap());

        let handle =
            Operation::new("read").respond_parts(&session(), StatusCode::OK, &headers, body);
        let canceller = handle.canceller();
        let mut stream = handle.stream();

        canceller.cancel();
        canceller.cancel();
        assert!(canceller.is_cancelled());

        assert!(matches!(stream.next().await, Some(Err(Error::Cancelled))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn cancel_rejects_the_buffered_future() {
        let body = stream::pending::<std::result::Result<Bytes, Error>>();
        let mut headers = http::HeaderMap::new();
        headers.insert("content-type", MULTIPART.parse().unwrap());

        let handle =
            Operation::new("read").respond_parts(&session(), StatusCode::OK, &headers, body);
        let canceller = handle.canceller();

        let pending = tokio::spawn(handle.result());
        tokio::task::yield_now().await;
        canceller.cancel();

        assert!(matches!(pending.await.unwrap(), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn unattended_response_is_drained() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let body = stream::iter(
            TWO_DOCS
                .as_bytes()
                .chunks(3)
                .map(|c| Ok::<_, Error>(Bytes::copy_from_slice(c)))
                .collect::<Vec<_>>(),
        )
        .chain(stream::once(async move {
            let _ = tx.send(());
            Ok(Bytes::new())
        }));

        let mut headers = http::HeaderMap::new();
        headers.insert("content-type", MULTIPART.parse().unwrap());

        let session = session().channel_capacity(1);
        drop(Operation::new("read").respond_parts(&session, StatusCode::OK, &headers, body));

        // The final chunk is only produced once everything before it was read.
        tokio::time::timeout(std::time::Duration::from_secs(5), rx)
            .await
            .expect("response drained")
            .unwrap();
    }

    #[test]
    fn collector_reassembles_binary() {
        let mut c = Collector::default();
        c.push(ReadEvent::BinaryStart(DocumentRecord::new("/x"))).unwrap();
        c.push(ReadEvent::BinaryChunk(Bytes::from_static(b"ab"))).unwrap();
        c.push(ReadEvent::BinaryChunk(Bytes::from_static(b"c"))).unwrap();
        c.push(ReadEvent::BinaryEnd).unwrap();
        c.push(ReadEvent::Summary(json!(1))).unwrap();

        let records = c.finish().unwrap();
        assert_eq!(2, records.len());
        assert_eq!(
            Some(&b"abc"[..]),
            records[0].as_document().and_then(|d| d.content.as_ref()).and_then(Content::as_bytes)
        );

        let mut c = Collector::default();
        assert!(c.push(ReadEvent::BinaryEnd).is_err());

        let mut c = Collector::default();
        c.push(ReadEvent::BinaryStart(DocumentRecord::new("/x"))).unwrap();
        assert!(c.finish().is_err());
    }
}
