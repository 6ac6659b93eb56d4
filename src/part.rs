use bytes::BytesMut;
use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE,
};

use crate::disposition::{self, Disposition, ParamValue, PartType};
use crate::format::{resolve_format, Format};
use crate::{Error, Result};

/// Structured headers of a single part.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartHeaders {
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub part_type: Option<PartType>,
    /// Taken from the disposition `filename`.
    pub uri: Option<String>,
    pub categories: Vec<String>,
    pub disposition: Disposition,
}

impl PartHeaders {
    /// Parses a raw header block, the bytes between a boundary line and the
    /// blank line that starts the body.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let headers = header_map(raw);

        let disposition = match headers.get(CONTENT_DISPOSITION) {
            Some(v) => {
                let v = v
                    .to_str()
                    .map_err(|e| Error::malformed(format!("Content-Disposition: {}", e)))?;
                disposition::parse(v)?
            }
            None => Disposition::default(),
        };

        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string());

        let content_length = match headers.get(CONTENT_LENGTH) {
            Some(v) => Some(
                v.to_str()
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .ok_or_else(|| {
                        Error::malformed(format!("invalid part Content-Length: {:?}", v))
                    })?,
            ),
            None => None,
        };

        Ok(PartHeaders {
            content_type,
            content_length,
            part_type: disposition.part_type,
            uri: disposition.uri().map(str::to_string),
            categories: disposition.categories(),
            disposition,
        })
    }

    pub fn format(&self) -> Format {
        resolve_format(self.content_type.as_deref())
    }

    pub fn is_inline(&self) -> bool {
        self.part_type == Some(PartType::Inline)
    }

    /// A part carrying any category besides `content`.
    pub fn is_metadata(&self) -> bool {
        self.categories.iter().any(|c| c != "content")
    }

    /// An inline part with no category is a plain value, such as a search
    /// summary, rather than a document body.
    pub fn is_value(&self) -> bool {
        self.is_inline() && self.categories.is_empty()
    }

    /// Whether the body is buffered and decoded instead of forwarded in chunks.
    pub fn is_text(&self) -> bool {
        self.is_inline() || self.is_metadata() || self.format().is_textual()
    }

    /// Content type without parameters.
    pub fn essence(&self) -> Option<String> {
        self.content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .map(|s| s.trim().to_string())
    }

    /// The essence, unless it is just the default type of the part's format.
    pub fn declared_type(&self) -> Option<String> {
        let default = self.format().content_type();
        self.essence().filter(|e| !e.eq_ignore_ascii_case(default))
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.disposition.get(key).map(ParamValue::first)
    }
}

/// A part whose headers are known, together with its body so far.
#[derive(Debug)]
pub(crate) struct Part {
    pub headers: PartHeaders,
    pub body: PartBody,
}

#[derive(Debug)]
pub(crate) enum PartBody {
    /// Buffered until the part ends.
    Text(BytesMut),
    /// Forwarded as it arrives. `started` once the leading record went out.
    Binary { started: bool },
}

impl Part {
    pub fn classify(headers: PartHeaders) -> Self {
        let body = if headers.is_text() {
            let cap = headers.content_length.unwrap_or(0).min(1 << 20) as usize;
            PartBody::Text(BytesMut::with_capacity(cap))
        } else {
            PartBody::Binary { started: false }
        };

        log::trace!(
            "Part {:?} classified as {}",
            headers.uri,
            if headers.is_text() { "text" } else { "binary" }
        );

        Part { headers, body }
    }
}

/// Returns an iterator over all the header lines, with their line endings trimmed.
pub(crate) fn header_lines(
    raw: &[u8],
) -> impl Iterator<Item = std::result::Result<&str, std::str::Utf8Error>> {
    raw.split(|e| *e == b'\n').map(|line| {
        // trim of the last \r
        std::str::from_utf8(line).map(|s| s.trim())
    })
}

fn header_map(raw: &[u8]) -> HeaderMap<HeaderValue> {
    let mut res = HeaderMap::new();

    header_lines(raw)
        .filter_map(|line| line.ok())
        .filter_map(parse_header_line)
        .for_each(|(name, value)| {
            res.append(name, value);
        });

    res
}

fn parse_header_line(s: &str) -> Option<(HeaderName, HeaderValue)> {
    let (name, value) = s.split_once(':')?;

    let header_name = HeaderName::from_bytes(name.trim().as_bytes());
    let header_value = HeaderValue::from_str(value.trim());

    match (header_name, header_value) {
        (Ok(name), Ok(value)) => Some((name, value)),
        _ => None,
    }
}
