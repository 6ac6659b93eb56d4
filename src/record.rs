//! Documents as they are read and written.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::format::Format;

/// Document content, decoded according to its [`Format`].
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Json(Value),
    /// Xml or plain text.
    Text(String),
    Binary(Bytes),
}

impl Content {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Content::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Content::Binary(b) => Some(b),
            _ => None,
        }
    }

    fn natural_format(&self) -> Format {
        match self {
            Content::Json(_) => Format::Json,
            Content::Text(_) => Format::Text,
            Content::Binary(_) => Format::Binary,
        }
    }
}

impl From<Value> for Content {
    fn from(v: Value) -> Self {
        Content::Json(v)
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<Bytes> for Content {
    fn from(b: Bytes) -> Self {
        Content::Binary(b)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(rename = "role-name")]
    pub role_name: String,
    pub capabilities: Vec<String>,
}

impl Permission {
    pub fn new<R: Into<String>>(role_name: R, capabilities: &[&str]) -> Self {
        Permission {
            role_name: role_name.into(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// The metadata categories of a document. Only categories that were
/// requested or supplied are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collections: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<Permission>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_values: Option<Map<String, Value>>,
    /// Categories without a typed field, kept so nothing is lost on a round trip.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.collections.is_none()
            && self.permissions.is_none()
            && self.quality.is_none()
            && self.properties.is_none()
            && self.metadata_values.is_none()
            && self.other.is_empty()
    }

    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = Some(collections.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.get_or_insert_with(Vec::new).push(permission);
        self
    }

    pub fn with_quality(mut self, quality: i64) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_property<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.properties
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }
}

/// One document, as produced by a read or consumed by a write.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    /// Absent only for inline bodies.
    pub uri: Option<String>,
    pub format: Format,
    /// Content type without parameters.
    pub content_type: Option<String>,
    pub content: Option<Content>,
    pub metadata: Option<Metadata>,
}

impl DocumentRecord {
    pub fn new<U: Into<String>>(uri: U) -> Self {
        DocumentRecord {
            uri: Some(uri.into()),
            format: Format::None,
            content_type: None,
            content: None,
            metadata: None,
        }
    }

    pub fn inline() -> Self {
        DocumentRecord {
            uri: None,
            format: Format::None,
            content_type: None,
            content: None,
            metadata: None,
        }
    }

    /// Sets the content. The format follows a declared content type, else the
    /// uri extension when it agrees with the content, else the content.
    pub fn with_content<C: Into<Content>>(mut self, content: C) -> Self {
        let content = content.into();
        let natural = content.natural_format();

        self.format = match (self.content_type.as_deref(), self.uri.as_deref()) {
            (Some(ct), _) => crate::format::resolve_format(Some(ct)),
            (None, uri) => match (uri.and_then(Format::from_uri), natural) {
                (Some(Format::Xml), Format::Text) => Format::Xml,
                (Some(Format::Text), Format::Text) => Format::Text,
                _ => natural,
            },
        };
        self.content = Some(content);
        self
    }

    /// Sets a content type and the format it resolves to.
    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        let content_type = content_type.into();
        if self.content.is_some() {
            self.format = crate::format::resolve_format(Some(&content_type));
        }
        self.content_type = Some(content_type);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The content type to declare when writing this document: the explicit
    /// one, else the one of its format, else a guess from the uri extension.
    pub fn declared_content_type(&self) -> String {
        if let Some(ref ct) = self.content_type {
            return ct.clone();
        }

        let format = match self.format {
            Format::None => self
                .uri
                .as_deref()
                .and_then(Format::from_uri)
                .unwrap_or(Format::Binary),
            format => format,
        };
        format.content_type().to_string()
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata.as_ref().map_or(false, |m| !m.is_empty())
    }
}

/// A single result delivered by a read.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Document(DocumentRecord),
    /// A value that is not a document, such as a search summary or a write
    /// acknowledgement.
    Summary(Value),
}

impl Record {
    pub fn as_document(&self) -> Option<&DocumentRecord> {
        match self {
            Record::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_document(self) -> Option<DocumentRecord> {
        match self {
            Record::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_summary(&self) -> Option<&Value> {
        match self {
            Record::Summary(v) => Some(v),
            _ => None,
        }
    }
}

/// What the reader emits, in wire order.
///
/// Binary content is not buffered: a `BinaryStart` carrying the record
/// (metadata merged, content absent) is followed by zero or more
/// `BinaryChunk`s and one `BinaryEnd`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadEvent {
    Document(DocumentRecord),
    Summary(Value),
    BinaryStart(DocumentRecord),
    BinaryChunk(Bytes),
    BinaryEnd,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_serializes_only_present_categories() {
        let m = Metadata::default().with_collections(vec!["c1"]);
        assert_eq!(json!({"collections": ["c1"]}), serde_json::to_value(&m).unwrap());

        let m = Metadata::default()
            .with_permission(Permission::new("app-user", &["read", "update"]))
            .with_quality(2)
            .with_property("owner", json!("me"));
        assert_eq!(
            json!({
                "permissions": [{"role-name": "app-user", "capabilities": ["read", "update"]}],
                "quality": 2,
                "properties": {"owner": "me"}
            }),
            serde_json::to_value(&m).unwrap()
        );
    }

    #[test]
    fn metadata_keeps_unknown_categories() {
        let m: Metadata =
            serde_json::from_value(json!({"collections": [], "temporal": {"axis": "x"}})).unwrap();

        assert_eq!(Some(vec![]), m.collections);
        assert_eq!(Some(&json!({"axis": "x"})), m.other.get("temporal"));
        assert_eq!(
            json!({"collections": [], "temporal": {"axis": "x"}}),
            serde_json::to_value(&m).unwrap()
        );
    }

    #[test]
    fn format_follows_content_and_uri() {
        assert_eq!(
            Format::Json,
            DocumentRecord::new("/a.json").with_content(json!({"x": 1})).format
        );
        assert_eq!(Format::Xml, DocumentRecord::new("/b.xml").with_content("<v/>").format);
        assert_eq!(Format::Text, DocumentRecord::new("/b").with_content("plain").format);
        assert_eq!(
            Format::Binary,
            DocumentRecord::new("/c.png").with_content(Bytes::from_static(b"\x89PNG")).format
        );
        assert_eq!(
            Format::Xml,
            DocumentRecord::inline()
                .with_content("<v/>")
                .with_content_type("application/xml")
                .format
        );
        assert_eq!(Format::None, DocumentRecord::new("/m.json").format);
    }

    #[test]
    fn declared_content_type_wins_in_any_order() {
        let before = DocumentRecord::new("/x")
            .with_content_type("application/xml")
            .with_content("<v/>");
        let after = DocumentRecord::new("/x")
            .with_content("<v/>")
            .with_content_type("application/xml");

        assert_eq!(Format::Xml, before.format);
        assert_eq!(before, after);
    }

    #[test]
    fn declared_content_type_defaults_to_format() {
        let d = DocumentRecord::new("/b.xml").with_content("<v/>");
        assert_eq!("application/xml", d.declared_content_type());

        let d = d.with_content_type("application/xslt+xml");
        assert_eq!("application/xslt+xml", d.declared_content_type());

        assert_eq!("application/json", DocumentRecord::new("/big.json").declared_content_type());
        assert_eq!("application/octet-stream", DocumentRecord::new("/big").declared_content_type());
    }
}
