use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};
use thiserror::Error;

use crate::response::ResponseEnvelope;
use crate::timeout::TimeoutKind;

pub type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Reset,
    Read,
    Other,
}

impl TransportErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Reset => "reset",
            Self::Read => "read",
            Self::Other => "other",
        }
    }

    /// Failures that happen before or while a connection is usable.
    pub const fn is_connection_level(self) -> bool {
        matches!(self, Self::Dns | Self::Connect | Self::Tls | Self::Reset)
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttachmentErrorKind {
    NotFound,
    PermissionDenied,
    Other,
}

impl From<io::ErrorKind> for AttachmentErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for AttachmentErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::NotFound => "not found",
            Self::PermissionDenied => "permission denied",
            Self::Other => "io error",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUrl,
    InvalidHeaderName,
    InvalidHeaderValue,
    Serialize,
    Transport,
    Timeout,
    Parse,
    MissingRedirectLocation,
    InvalidRedirectLocation,
    RedirectLimitExceeded,
    Middleware,
    Attachment,
    Decode,
    HttpStatus,
    Aborted,
    TransportInit,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid_url",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::Serialize => "serialize",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Parse => "parse",
            Self::MissingRedirectLocation => "missing_redirect_location",
            Self::InvalidRedirectLocation => "invalid_redirect_location",
            Self::RedirectLimitExceeded => "redirect_limit_exceeded",
            Self::Middleware => "middleware",
            Self::Attachment => "attachment",
            Self::Decode => "decode",
            Self::HttpStatus => "http_status",
            Self::Aborted => "aborted",
            Self::TransportInit => "transport_init",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    #[error("invalid request url: {url}")]
    InvalidUrl { url: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request body as {content_type}: {source}")]
    Serialize {
        content_type: String,
        #[source]
        source: BoxError,
    },
    #[error("http transport error ({kind}) for {method} {url}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        url: String,
        #[source]
        source: BoxError,
    },
    #[error("{kind} timeout after {elapsed_ms}ms for {method} {url}")]
    Timeout {
        kind: TimeoutKind,
        elapsed_ms: u128,
        method: Method,
        url: String,
    },
    #[error("failed to parse {content_type} response body (status {status}): {source}")]
    Parse {
        status: u16,
        content_type: String,
        payload: Bytes,
        #[source]
        source: BoxError,
    },
    #[error("redirect response {status} missing location header for {method} {url}")]
    MissingRedirectLocation {
        status: u16,
        method: Method,
        url: String,
    },
    #[error("invalid redirect location {location} for {method} {url}")]
    InvalidRedirectLocation {
        location: String,
        method: Method,
        url: String,
    },
    #[error("redirect limit exceeded after {followed} redirects for {method} {url}")]
    RedirectLimitExceeded {
        followed: usize,
        method: Method,
        url: String,
    },
    #[error("middleware {stage} failed: {source}")]
    Middleware {
        stage: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to read multipart attachment {} ({kind}): {source}", .path.display())]
    Attachment {
        path: PathBuf,
        kind: AttachmentErrorKind,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode response content-encoding {encoding}: {message}")]
    Decode { encoding: String, message: String },
    #[error("http status error {status} for {method} {url}")]
    Status {
        status: u16,
        method: Method,
        url: String,
        response: Box<ResponseEnvelope>,
    },
    #[error("request aborted")]
    Aborted,
    #[error("failed to initialize http transport: {source}")]
    TransportInit {
        #[source]
        source: BoxError,
    },
}

/// Counters accumulated over one logical call, attached to every terminal error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LifecycleMetadata {
    pub redirects: usize,
    pub retries: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    metadata: LifecycleMetadata,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn metadata(&self) -> LifecycleMetadata {
        self.metadata
    }

    pub fn redirects(&self) -> usize {
        self.metadata.redirects
    }

    pub fn retries(&self) -> usize {
        self.metadata.retries
    }

    pub fn elapsed(&self) -> Duration {
        self.metadata.elapsed
    }

    pub(crate) fn with_metadata(mut self, metadata: LifecycleMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub const fn code(&self) -> ErrorCode {
        match &self.kind {
            ErrorKind::InvalidUrl { .. } => ErrorCode::InvalidUrl,
            ErrorKind::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            ErrorKind::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            ErrorKind::Serialize { .. } => ErrorCode::Serialize,
            ErrorKind::Transport { .. } => ErrorCode::Transport,
            ErrorKind::Timeout { .. } => ErrorCode::Timeout,
            ErrorKind::Parse { .. } => ErrorCode::Parse,
            ErrorKind::MissingRedirectLocation { .. } => ErrorCode::MissingRedirectLocation,
            ErrorKind::InvalidRedirectLocation { .. } => ErrorCode::InvalidRedirectLocation,
            ErrorKind::RedirectLimitExceeded { .. } => ErrorCode::RedirectLimitExceeded,
            ErrorKind::Middleware { .. } => ErrorCode::Middleware,
            ErrorKind::Attachment { .. } => ErrorCode::Attachment,
            ErrorKind::Decode { .. } => ErrorCode::Decode,
            ErrorKind::Status { .. } => ErrorCode::HttpStatus,
            ErrorKind::Aborted => ErrorCode::Aborted,
            ErrorKind::TransportInit { .. } => ErrorCode::TransportInit,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match &self.kind {
            ErrorKind::Status { status, .. } | ErrorKind::Parse { status, .. } => {
                StatusCode::from_u16(*status).ok()
            }
            _ => None,
        }
    }

    pub fn timeout_kind(&self) -> Option<TimeoutKind> {
        match &self.kind {
            ErrorKind::Timeout { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match &self.kind {
            ErrorKind::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// The response that produced a status error, when there is one.
    pub fn response(&self) -> Option<&ResponseEnvelope> {
        match &self.kind {
            ErrorKind::Status { response, .. } => Some(response),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.kind, ErrorKind::Aborted)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            metadata: LifecycleMetadata::default(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.kind, formatter)?;
        if self.metadata.retries > 0 {
            write!(formatter, " (after {} retries)", self.metadata.retries)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.kind.source()
    }
}
