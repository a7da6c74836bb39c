//! Content-type keyed serializers and parsers.
//!
//! Lookup normalizes the MIME type (lowercase, parameters stripped) and falls
//! back explicitly: `+json` suffixes use the JSON entry, `text/*` parses as
//! text, and everything else parses as opaque binary.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use url::form_urlencoded;

use crate::error::BoxError;

pub const APPLICATION_JSON: &str = "application/json";
pub const APPLICATION_FORM: &str = "application/x-www-form-urlencoded";
pub const TEXT_PLAIN: &str = "text/plain";
pub const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";

pub trait BodySerializer: Send + Sync {
    fn serialize(&self, value: &Value) -> Result<Bytes, BoxError>;
}

pub trait BodyParser: Send + Sync {
    fn parse(&self, payload: &[u8]) -> Result<ParsedBody, BoxError>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParsedBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
    Text(String),
    Binary(Bytes),
}

impl ParsedBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_form(&self) -> Option<&[(String, String)]> {
        match self {
            Self::Form(pairs) => Some(pairs),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl BodySerializer for JsonCodec {
    fn serialize(&self, value: &Value) -> Result<Bytes, BoxError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }
}

impl BodyParser for JsonCodec {
    fn parse(&self, payload: &[u8]) -> Result<ParsedBody, BoxError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(ParsedBody::Empty);
        }
        Ok(ParsedBody::Json(serde_json::from_slice(payload)?))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FormCodec;

impl BodySerializer for FormCodec {
    fn serialize(&self, value: &Value) -> Result<Bytes, BoxError> {
        match value {
            Value::String(encoded) => Ok(Bytes::from(encoded.clone())),
            Value::Object(_) => Ok(Bytes::from(serde_urlencoded::to_string(value)?)),
            Value::Array(pairs) => {
                let mut encoder = form_urlencoded::Serializer::new(String::new());
                for pair in pairs {
                    match pair.as_array().map(Vec::as_slice) {
                        Some([name, value]) => {
                            encoder.append_pair(&form_scalar(name)?, &form_scalar(value)?);
                        }
                        _ => return Err(format!("form pairs need two entries, got {pair}").into()),
                    }
                }
                Ok(Bytes::from(encoder.finish()))
            }
            other => Err(format!("form bodies need an object, pairs or a pre-encoded string, got {other}").into()),
        }
    }
}

fn form_scalar(value: &Value) -> Result<String, BoxError> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        other => Err(format!("form values must be scalars, got {other}").into()),
    }
}

impl BodyParser for FormCodec {
    fn parse(&self, payload: &[u8]) -> Result<ParsedBody, BoxError> {
        let pairs = form_urlencoded::parse(payload)
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        Ok(ParsedBody::Form(pairs))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TextCodec;

impl BodySerializer for TextCodec {
    fn serialize(&self, value: &Value) -> Result<Bytes, BoxError> {
        match value {
            Value::String(text) => Ok(Bytes::from(text.clone())),
            other => Ok(Bytes::from(other.to_string())),
        }
    }
}

impl BodyParser for TextCodec {
    fn parse(&self, payload: &[u8]) -> Result<ParsedBody, BoxError> {
        Ok(ParsedBody::Text(String::from_utf8_lossy(payload).into_owned()))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryCodec;

impl BodySerializer for BinaryCodec {
    fn serialize(&self, value: &Value) -> Result<Bytes, BoxError> {
        match value {
            Value::String(text) => Ok(Bytes::from(text.clone())),
            _ => Err("binary bodies need raw bytes or a string".into()),
        }
    }
}

impl BodyParser for BinaryCodec {
    fn parse(&self, payload: &[u8]) -> Result<ParsedBody, BoxError> {
        Ok(ParsedBody::Binary(Bytes::copy_from_slice(payload)))
    }
}

/// `"Application/JSON; charset=utf-8"` becomes `"application/json"`.
pub fn normalize_mime(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_json_suffix(mime: &str) -> bool {
    mime.ends_with("+json")
}

#[derive(Clone)]
pub struct CodecRegistry {
    serializers: BTreeMap<String, Arc<dyn BodySerializer>>,
    parsers: BTreeMap<String, Arc<dyn BodyParser>>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CodecRegistry")
            .field("serializers", &self.serializers.keys().collect::<Vec<_>>())
            .field("parsers", &self.parsers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self {
            serializers: BTreeMap::new(),
            parsers: BTreeMap::new(),
        }
    }

    pub fn standard() -> Self {
        Self::empty()
            .with_serializer(APPLICATION_JSON, Arc::new(JsonCodec))
            .with_serializer(APPLICATION_FORM, Arc::new(FormCodec))
            .with_serializer(TEXT_PLAIN, Arc::new(TextCodec))
            .with_serializer(APPLICATION_OCTET_STREAM, Arc::new(BinaryCodec))
            .with_parser(APPLICATION_JSON, Arc::new(JsonCodec))
            .with_parser(APPLICATION_FORM, Arc::new(FormCodec))
            .with_parser(TEXT_PLAIN, Arc::new(TextCodec))
            .with_parser(APPLICATION_OCTET_STREAM, Arc::new(BinaryCodec))
    }

    pub fn with_serializer(mut self, mime: &str, serializer: Arc<dyn BodySerializer>) -> Self {
        self.set_serializer(mime, serializer);
        self
    }

    pub fn with_parser(mut self, mime: &str, parser: Arc<dyn BodyParser>) -> Self {
        self.set_parser(mime, parser);
        self
    }

    pub fn set_serializer(&mut self, mime: &str, serializer: Arc<dyn BodySerializer>) {
        self.serializers.insert(normalize_mime(mime), serializer);
    }

    pub fn set_parser(&mut self, mime: &str, parser: Arc<dyn BodyParser>) {
        self.parsers.insert(normalize_mime(mime), parser);
    }

    /// `None` means nothing is registered that can produce this content type.
    pub fn serializer_for(&self, content_type: &str) -> Option<Arc<dyn BodySerializer>> {
        let mime = normalize_mime(content_type);
        if let Some(serializer) = self.serializers.get(&mime) {
            return Some(Arc::clone(serializer));
        }
        if is_json_suffix(&mime) {
            return self.serializers.get(APPLICATION_JSON).cloned();
        }
        None
    }

    pub fn parser_for(&self, content_type: Option<&str>) -> Arc<dyn BodyParser> {
        let mime = content_type.map(normalize_mime).unwrap_or_default();
        if let Some(parser) = self.parsers.get(&mime) {
            return Arc::clone(parser);
        }
        if is_json_suffix(&mime)
            && let Some(parser) = self.parsers.get(APPLICATION_JSON)
        {
            return Arc::clone(parser);
        }
        if mime.starts_with("text/") {
            return self
                .parsers
                .get(TEXT_PLAIN)
                .cloned()
                .unwrap_or_else(|| Arc::new(TextCodec));
        }
        self.parsers
            .get(APPLICATION_OCTET_STREAM)
            .cloned()
            .unwrap_or_else(|| Arc::new(BinaryCodec))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
