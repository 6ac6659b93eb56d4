//! Coarse classification of document content by MIME type.

use std::fmt;

/// The content classes that drive how a part is encoded and decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Json,
    Xml,
    Text,
    /// Binary or unknown content.
    Binary,
    /// No content at all, e.g. a metadata only record.
    None,
}

impl Format {
    /// The content type the writer declares for this format when a document
    /// carries none of its own.
    pub fn content_type(self) -> &'static str {
        match self {
            Format::Json => "application/json",
            Format::Xml => "application/xml",
            Format::Text => "text/plain",
            Format::Binary | Format::None => "application/octet-stream",
        }
    }

    /// Json, xml and text are buffered and decoded, everything else is passed
    /// through as bytes.
    pub fn is_textual(self) -> bool {
        matches!(self, Format::Json | Format::Xml | Format::Text)
    }

    /// Guesses the format from the extension of a document uri.
    pub fn from_uri(uri: &str) -> Option<Format> {
        let name = uri.rsplit('/').next()?;
        let (_, ext) = name.rsplit_once('.')?;

        match ext.to_ascii_lowercase().as_str() {
            "json" => Some(Format::Json),
            "xml" | "xsd" | "xsl" | "xslt" | "xhtml" | "svg" => Some(Format::Xml),
            "txt" | "text" | "csv" | "md" | "html" | "htm" | "css" | "js" | "sjs" => {
                Some(Format::Text)
            }
            "bin" | "png" | "jpg" | "jpeg" | "gif" | "pdf" | "zip" | "gz" => Some(Format::Binary),
            _ => None,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Format::Json => "json",
            Format::Xml => "xml",
            Format::Text => "text",
            Format::Binary => "binary",
            Format::None => "none",
        };
        f.write_str(s)
    }
}

/// Maps a content type to its [`Format`]. Parameters such as `charset` are
/// ignored and unknown input yields [`Format::Binary`].
pub fn resolve_format(content_type: Option<&str>) -> Format {
    let essence = match content_type.and_then(|ct| ct.split(';').next()) {
        Some(essence) => essence.trim().to_ascii_lowercase(),
        None => return Format::Binary,
    };

    let mut tokens = essence.split(|c| c == '/' || c == '+');
    let top = tokens.next().unwrap_or_default();
    let rest: Vec<&str> = tokens.collect();

    if (top == "application" || top == "text") && rest.iter().any(|t| t.contains("json")) {
        Format::Json
    } else if rest.iter().any(|t| t.contains("xml")) {
        Format::Xml
    } else if top == "text" && !rest.is_empty() {
        Format::Text
    } else {
        Format::Binary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_types() {
        let tests = [
            ("application/json", Format::Json),
            ("application/json; charset=utf-8", Format::Json),
            ("application/vnd.marklogic-rdf+json", Format::Json),
            ("text/json", Format::Json),
            ("application/xml", Format::Xml),
            ("text/xml; charset=UTF-8", Format::Xml),
            ("application/xhtml+xml", Format::Xml),
            ("image/svg+xml", Format::Xml),
            ("text/plain", Format::Text),
            ("text/html", Format::Text),
            ("TEXT/CSV", Format::Text),
            ("application/octet-stream", Format::Binary),
            ("image/png", Format::Binary),
            ("image/json", Format::Binary),
            ("", Format::Binary),
            ("garbage", Format::Binary),
        ];

        for (ct, exp) in &tests {
            assert_eq!(*exp, resolve_format(Some(ct)), "content type {:?}", ct);
        }

        assert_eq!(Format::Binary, resolve_format(None));
    }

    #[test]
    fn declared_content_type_resolves_back() {
        for format in &[Format::Json, Format::Xml, Format::Text, Format::Binary] {
            assert_eq!(*format, resolve_format(Some(format.content_type())));

            let with_charset = format!("{}; charset=utf-8", format.content_type());
            assert_eq!(*format, resolve_format(Some(&with_charset)));
        }
    }

    #[test]
    fn format_from_uri_extension() {
        assert_eq!(Some(Format::Json), Format::from_uri("/a.json"));
        assert_eq!(Some(Format::Xml), Format::from_uri("/dir.v2/b.XML"));
        assert_eq!(Some(Format::Text), Format::from_uri("notes.txt"));
        assert_eq!(Some(Format::Binary), Format::from_uri("/img/cat.png"));
        assert_eq!(None, Format::from_uri("/dir.json/noext"));
        assert_eq!(None, Format::from_uri("/a.unknown"));
    }
}
