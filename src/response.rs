use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::Result;
use crate::codec::{BodyParser, ParsedBody};
use crate::error::{Error, ErrorKind};

/// Status-derived flags.
pub trait StatusInfo {
    fn status(&self) -> StatusCode;

    fn status_class(&self) -> u16 {
        self.status().as_u16() / 100
    }

    fn is_info(&self) -> bool {
        self.status_class() == 1
    }

    /// 2xx only; an unfollowed 3xx is neither ok nor an error.
    fn is_ok(&self) -> bool {
        self.status_class() == 2
    }

    fn is_redirect(&self) -> bool {
        self.status_class() == 3
    }

    fn is_client_error(&self) -> bool {
        self.status_class() == 4
    }

    fn is_server_error(&self) -> bool {
        self.status_class() == 5
    }

    fn is_error(&self) -> bool {
        self.is_client_error() || self.is_server_error()
    }

    fn is_no_content(&self) -> bool {
        self.status() == StatusCode::NO_CONTENT
    }

    fn is_bad_request(&self) -> bool {
        self.status() == StatusCode::BAD_REQUEST
    }

    fn is_unauthorized(&self) -> bool {
        self.status() == StatusCode::UNAUTHORIZED
    }

    fn is_forbidden(&self) -> bool {
        self.status() == StatusCode::FORBIDDEN
    }

    fn is_not_found(&self) -> bool {
        self.status() == StatusCode::NOT_FOUND
    }
}

pub trait HeaderAccess {
    fn headers(&self) -> &HeaderMap;

    /// Case-insensitive; `None` for absent or non-UTF-8 values.
    fn header(&self, name: &str) -> Option<&str> {
        self.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    fn content_type(&self) -> Option<&str> {
        self.headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }
}

pub trait Readable {
    fn payload(&self) -> &Bytes;

    fn text(&self) -> String {
        String::from_utf8_lossy(self.payload()).into_owned()
    }

    fn is_empty_body(&self) -> bool {
        self.payload().is_empty()
    }
}

/// A fully-read response and the path that led to it.
pub struct ResponseEnvelope {
    status: StatusCode,
    headers: HeaderMap,
    payload: Bytes,
    url: Url,
    redirect_chain: Vec<Url>,
    parser: Arc<dyn BodyParser>,
    parsed: OnceLock<ParsedBody>,
}

impl ResponseEnvelope {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        payload: Bytes,
        url: Url,
        redirect_chain: Vec<Url>,
        parser: Arc<dyn BodyParser>,
    ) -> Self {
        Self {
            status,
            headers,
            payload,
            url,
            redirect_chain,
            parser,
            parsed: OnceLock::new(),
        }
    }

    /// Where the final response came from.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Locations followed to reach this response, in order.
    pub fn redirect_chain(&self) -> &[Url] {
        &self.redirect_chain
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Replaces the payload and forgets any previously parsed body.
    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
        self.parsed = OnceLock::new();
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Parses the payload with the codec chosen for this response. Runs once;
    /// later calls return the cached result.
    pub fn body(&self) -> Result<&ParsedBody> {
        if let Some(parsed) = self.parsed.get() {
            return Ok(parsed);
        }
        let parsed = self.parse_payload()?;
        Ok(self.parsed.get_or_init(|| parsed))
    }

    pub fn json<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.payload).map_err(|source| {
            Error::from(ErrorKind::Parse {
                status: self.status.as_u16(),
                content_type: self.content_type().unwrap_or("application/json").to_owned(),
                payload: self.payload.clone(),
                source: Box::new(source),
            })
        })
    }

    fn parse_payload(&self) -> Result<ParsedBody> {
        if self.payload.is_empty() {
            return Ok(ParsedBody::Empty);
        }
        self.parser.parse(&self.payload).map_err(|source| {
            Error::from(ErrorKind::Parse {
                status: self.status.as_u16(),
                content_type: self.content_type().unwrap_or_default().to_owned(),
                payload: self.payload.clone(),
                source,
            })
        })
    }
}

impl StatusInfo for ResponseEnvelope {
    fn status(&self) -> StatusCode {
        self.status
    }
}

impl HeaderAccess for ResponseEnvelope {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

impl Readable for ResponseEnvelope {
    fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl std::fmt::Debug for ResponseEnvelope {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ResponseEnvelope")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("payload_len", &self.payload.len())
            .field("redirect_chain", &self.redirect_chain.len())
            .finish_non_exhaustive()
    }
}
