use std::fmt;

use http::StatusCode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Cannot turn a response without content type into multipart.
    #[error("Content Type header missing from response")]
    ContentTypeMissing,

    #[error("Cannot handle a non multipart/mixed response as multipart")]
    NotMultipart,

    /// The transport reported a zero length body.
    #[error("Response body is empty")]
    EmptyBody,

    #[error("Malformed Multipart: {0}")]
    MalformedMultipart(String),

    #[error("Content-Type value invalid: {0}")]
    InvalidMimeType(#[from] mime::FromStrError),

    #[error("Invalid boundary: {0}")]
    InvalidBoundary(String),

    /// A part declared as json did not parse.
    #[error("JSON part invalid: {0}")]
    Json(#[from] serde_json::Error),

    /// The server answered with a status the operation does not accept.
    #[error("Unexpected status {status}")]
    Status {
        status: StatusCode,
        body: Option<serde_json::Value>,
    },

    #[error("InnerStream: {0}")]
    InnerStream(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Response closed before completion")]
    ConnectionClosed,
}

impl Error {
    pub(crate) fn malformed<S: Into<String>>(msg: S) -> Self {
        Error::MalformedMultipart(msg.into())
    }

    pub(crate) fn inner<E: fmt::Display>(e: E) -> Self {
        Error::InnerStream(format!("{}", e))
    }

    /// Builds a status error, keeping the body as json when it parses and as a
    /// json string otherwise.
    pub(crate) fn status(status: StatusCode, body: &[u8]) -> Self {
        let body = if body.is_empty() {
            None
        } else {
            match serde_json::from_slice(body) {
                Ok(value) => Some(value),
                Err(_) => Some(serde_json::Value::String(
                    String::from_utf8_lossy(body).into_owned(),
                )),
            }
        };

        Error::Status { status, body }
    }

    /// True when the server rejected the request, as opposed to a response
    /// that could not be read.
    pub fn is_status(&self) -> bool {
        matches!(self, Error::Status { .. })
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        match *self {
            Error::Status { status, .. } => Some(status),
            _ => None,
        }
    }

    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::MalformedMultipart(_)
                | Error::Json(_)
                | Error::NotMultipart
                | Error::ContentTypeMissing
                | Error::InvalidMimeType(_)
                | Error::EmptyBody
        )
    }
}

impl From<hyper::Error> for Error {
    fn from(inner: hyper::Error) -> Self {
        Error::InnerStream(format!("Hyper error: {}", inner))
    }
}
