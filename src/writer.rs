use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use tokio::sync::mpsc;

use crate::record::{Content, DocumentRecord};
use crate::{Error, Result, Session};

const CRLF: &[u8] = b"\r\n";

/// Frames documents into a multipart/mixed body.
///
/// Every document becomes a metadata part (when it has metadata) followed by
/// a content part (when it has content), which is the order the reader
/// correlates them in.
#[derive(Debug, Clone)]
pub struct MultipartWriter {
    boundary: Arc<str>,
    upload_capacity: usize,
}

impl MultipartWriter {
    pub fn new(session: &Session) -> Self {
        MultipartWriter {
            boundary: session.boundary().into(),
            upload_capacity: session.get_upload_capacity(),
        }
    }

    /// Frames all documents into one body, closing boundary included.
    pub fn write_batch<'a, I>(&self, documents: I) -> Result<Bytes>
    where
        I: IntoIterator<Item = &'a DocumentRecord>,
    {
        let mut out = BytesMut::new();
        let mut count = 0;

        for document in documents {
            if !document.has_metadata() && document.content.is_none() {
                log::warn!("Skipping {:?}, it has neither metadata nor content", document.uri);
                continue;
            }

            self.write_metadata(&mut out, document)?;

            if let Some(ref content) = document.content {
                let body = encode(content)?;
                let content_type = content_type_for(document, Some(content));
                self.write_part_head(
                    &mut out,
                    &content_type,
                    &disposition(document),
                    "content",
                    Some(body.len()),
                );
                out.extend_from_slice(&body);
                out.extend_from_slice(CRLF);
            }

            count += 1;
        }

        self.write_close(&mut out);
        log::debug!("Framed {} documents into {} bytes", count, out.len());

        Ok(out.freeze())
    }

    /// Starts a streamed upload of a single document.
    ///
    /// The metadata part and the content part headers are sent up front,
    /// followed by the document's own content if it has any. Further content
    /// is sent through the returned [`DocumentUpload`], and the closing
    /// boundary goes out on [`DocumentUpload::finish`].
    pub fn upload(&self, document: &DocumentRecord) -> Result<(DocumentUpload, UploadBody)> {
        let mut head = BytesMut::new();

        self.write_metadata(&mut head, document)?;

        let content_type = content_type_for(document, document.content.as_ref());
        self.write_part_head(&mut head, &content_type, &disposition(document), "content", None);

        if let Some(ref content) = document.content {
            head.extend_from_slice(&encode(content)?);
        }

        let mut trailer = BytesMut::with_capacity(self.boundary.len() + 8);
        trailer.extend_from_slice(CRLF);
        self.write_close(&mut trailer);

        let (tx, rx) = mpsc::channel(self.upload_capacity);

        let upload = DocumentUpload {
            tx,
            uri: document.uri.clone(),
        };
        let body = UploadBody {
            head: Some(head.freeze()),
            trailer: trailer.freeze(),
            rx,
            done: false,
        };

        Ok((upload, body))
    }

    fn write_metadata(&self, out: &mut BytesMut, document: &DocumentRecord) -> Result<()> {
        let metadata = match document.metadata {
            Some(ref m) if !m.is_empty() => m,
            _ => return Ok(()),
        };

        let body = serde_json::to_vec(metadata)?;
        self.write_part_head(
            out,
            "application/json",
            &disposition(document),
            "metadata",
            Some(body.len()),
        );
        out.extend_from_slice(&body);
        out.extend_from_slice(CRLF);
        Ok(())
    }

    fn write_part_head(
        &self,
        out: &mut BytesMut,
        content_type: &str,
        disposition: &str,
        category: &str,
        length: Option<usize>,
    ) {
        out.extend_from_slice(b"--");
        out.extend_from_slice(self.boundary.as_bytes());
        out.extend_from_slice(CRLF);

        out.put_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
        out.put_slice(
            format!("Content-Disposition: {}; category={}\r\n", disposition, category).as_bytes(),
        );
        if let Some(len) = length {
            out.put_slice(format!("Content-Length: {}\r\n", len).as_bytes());
        }

        out.extend_from_slice(CRLF);
    }

    fn write_close(&self, out: &mut BytesMut) {
        out.extend_from_slice(b"--");
        out.extend_from_slice(self.boundary.as_bytes());
        out.extend_from_slice(b"--\r\n");
    }
}

fn disposition(document: &DocumentRecord) -> String {
    match document.uri {
        Some(ref uri) => {
            let escaped = uri.replace('\\', "\\\\").replace('"', "\\\"");
            format!("attachment; filename=\"{}\"", escaped)
        }
        None => "inline".to_string(),
    }
}

/// Textual content gets a charset unless the declared type already has parameters.
fn content_type_for(document: &DocumentRecord, content: Option<&Content>) -> String {
    let ct = document.declared_content_type();
    match content {
        Some(Content::Json(_)) | Some(Content::Text(_)) if !ct.contains(';') => {
            format!("{}; charset=utf-8", ct)
        }
        _ => ct,
    }
}

fn encode(content: &Content) -> Result<Bytes> {
    Ok(match content {
        Content::Json(v) => Bytes::from(serde_json::to_vec(v)?),
        Content::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
        Content::Binary(b) => b.clone(),
    })
}

#[derive(Debug)]
enum Frame {
    Chunk(Bytes),
    Finish,
}

/// The sending half of a streamed upload.
///
/// Dropping it without calling [`finish`](DocumentUpload::finish) aborts the
/// upload: the body then ends with [`Error::Cancelled`] instead of a closing
/// boundary, so the request is not mistaken for a complete one.
#[derive(Debug)]
pub struct DocumentUpload {
    tx: mpsc::Sender<Frame>,
    uri: Option<String>,
}

impl DocumentUpload {
    /// Queues a chunk of content, waiting while the transport is behind.
    pub async fn send<B: Into<Bytes>>(&mut self, chunk: B) -> Result<()> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }

        self.tx
            .send(Frame::Chunk(chunk))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Writes the closing boundary.
    pub async fn finish(self) -> Result<()> {
        log::debug!("Finishing upload of {:?}", self.uri);
        self.tx
            .send(Frame::Finish)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    pub fn abort(self) {
        log::debug!("Aborting upload of {:?}", self.uri);
    }
}

/// The body side of a streamed upload, to be handed to the HTTP client.
#[derive(Debug)]
pub struct UploadBody {
    head: Option<Bytes>,
    trailer: Bytes,
    rx: mpsc::Receiver<Frame>,
    done: bool,
}

impl UploadBody {
    pub fn into_body(self) -> hyper::Body {
        hyper::Body::wrap_stream(self)
    }
}

impl Stream for UploadBody {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(head) = self.head.take() {
            return Poll::Ready(Some(Ok(head)));
        }

        if self.done {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Frame::Chunk(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Frame::Finish)) => {
                self.done = true;
                Poll::Ready(Some(Ok(self.trailer.clone())))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(Err(Error::Cancelled)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
