//! Bulk document transfer over `multipart/mixed` bodies.
//!
//! Reads split a response body into [`ReadEvent`]s, merging each metadata
//! part with the content part of the same document. Writes frame a batch of
//! [`DocumentRecord`]s into a single body, or stream one large document.
//! Both directions share the boundary of a [`Session`].
//!
//! ```no_run
//! # async fn run(response: http::Response<hyper::Body>) -> hyper_bulkdocs::Result<()> {
//! use hyper_bulkdocs::{Operation, Session};
//!
//! let session = Session::new();
//! let records = Operation::new("read")
//!     .respond(&session, response)
//!     .result()
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod error;
pub use error::{Error, Result};

mod format;
pub use format::{resolve_format, Format};

pub mod disposition;

mod part;
pub use part::PartHeaders;
pub use disposition::PartType;

pub(crate) mod parser;

mod record;
pub use record::{Content, DocumentRecord, Metadata, Permission, ReadEvent, Record};

mod session;
pub use session::{Session, DEFAULT_CHANNEL_CAP, DEFAULT_UPLOAD_CAP};

mod header_map;
pub use header_map::HeaderMap;

mod multipart;
pub use multipart::{MultipartReader, MultipartResponse, DEFAULT_BUFFER_CAP};

mod writer;
pub use writer::{DocumentUpload, MultipartWriter, UploadBody};

mod response;
pub use response::{Canceller, Operation, RecordStream, ResponseHandle, MAX_ERROR_BODY};

use std::fmt;

use futures::Stream;

/// Reads documents out of `s`, a body whose response headers are `headers`.
pub fn from_headers<S, B, E>(
    session: &Session,
    headers: impl HeaderMap,
    s: S,
) -> Result<impl Stream<Item = Result<ReadEvent>>>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    MultipartReader::from_headers(session, &headers, s)
}
