use std::sync::Arc;

use crate::multipart::DEFAULT_BUFFER_CAP;
use crate::writer::MultipartWriter;
use crate::{Error, Result};

/// Default number of read events buffered between the reader and a consumer.
pub const DEFAULT_CHANNEL_CAP: usize = 64;

/// Default number of chunks an upload may queue ahead of the transport.
pub const DEFAULT_UPLOAD_CAP: usize = 16;

/// Per connection settings shared by reads and writes.
///
/// The boundary token is fixed for the lifetime of the session, both
/// directions of the pipeline frame and split with the same one.
#[derive(Debug, Clone)]
pub struct Session {
    boundary: Arc<str>,
    buffer_capacity: usize,
    channel_capacity: usize,
    upload_capacity: usize,
}

impl Session {
    /// Creates a session with a freshly generated boundary.
    pub fn new() -> Self {
        let boundary = format!("BULKDOCS_BOUNDARY_{}", uuid::Uuid::new_v4().simple());
        Self::from_token(boundary.into())
    }

    /// Creates a session with a caller supplied boundary. The token must be
    /// 1 to 70 characters from the RFC 2046 boundary alphabet and must not
    /// end with a space.
    pub fn with_boundary<S: AsRef<str>>(boundary: S) -> Result<Self> {
        let b = boundary.as_ref();

        let valid_chars = b.chars().all(|c| {
            c.is_ascii_alphanumeric() || "'()+_,-./:=? ".contains(c)
        });

        if b.is_empty() || b.len() > 70 || !valid_chars || b.ends_with(' ') {
            return Err(Error::InvalidBoundary(b.to_string()));
        }

        Ok(Self::from_token(b.into()))
    }

    fn from_token(boundary: Arc<str>) -> Self {
        Session {
            boundary,
            buffer_capacity: DEFAULT_BUFFER_CAP,
            channel_capacity: DEFAULT_CHANNEL_CAP,
            upload_capacity: DEFAULT_UPLOAD_CAP,
        }
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn upload_capacity(mut self, capacity: usize) -> Self {
        self.upload_capacity = capacity.max(1);
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// `multipart/mixed; boundary=...`, for the `Content-Type` of writes and
    /// the `Accept` header of reads.
    pub fn content_type(&self) -> String {
        let token = self
            .boundary
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "'+_-.".contains(c));

        if !token {
            format!("multipart/mixed; boundary=\"{}\"", self.boundary)
        } else {
            format!("multipart/mixed; boundary={}", self.boundary)
        }
    }

    pub fn writer(&self) -> MultipartWriter {
        MultipartWriter::new(self)
    }

    pub(crate) fn get_buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub(crate) fn get_channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    pub(crate) fn get_upload_capacity(&self) -> usize {
        self.upload_capacity
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
