//! The seam between the lifecycle engine and the wire.
//!
//! A [`Transport`] opens one [`Connection`] per attempt; the connection sends a
//! single request and resolves once the response head arrives, handing the
//! body back as a stream. Dropping any of the returned futures or streams
//! aborts the underlying I/O.

#[cfg(feature = "hyper-transport")]
mod http1;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::error::{BoxError, TransportErrorKind};
use crate::headers::HeaderBag;
use crate::util::classify_transport_error;

#[cfg(feature = "hyper-transport")]
pub use http1::HyperTransport;

pub type ResponseStream = BoxStream<'static, Result<Bytes, TransportError>>;
pub type RequestStream = BoxStream<'static, Result<Bytes, BoxError>>;

#[derive(Debug, thiserror::Error)]
#[error("{kind} failure: {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    /// Classifies the failure from its source chain.
    pub fn from_source(source: impl Into<BoxError>) -> Self {
        let source = source.into();
        let kind = classify_transport_error(&*source);
        Self { kind, source }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn into_source(self) -> BoxError {
        self.source
    }
}

/// What goes on the request line and in the header block.
#[derive(Clone, Debug)]
pub struct RequestHead {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderBag,
}

pub enum OutboundBody {
    Empty,
    Buffered(Bytes),
    Streaming(RequestStream),
}

impl OutboundBody {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Buffered(bytes) => bytes.is_empty(),
            Self::Streaming(_) => false,
        }
    }
}

impl std::fmt::Debug for OutboundBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => formatter.write_str("Empty"),
            Self::Buffered(bytes) => formatter
                .debug_tuple("Buffered")
                .field(&bytes.len())
                .finish(),
            Self::Streaming(_) => formatter.write_str("Streaming"),
        }
    }
}

pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

pub trait Transport: Send + Sync {
    /// Establishes a connection able to carry one request to `url`'s origin.
    fn connect<'a>(
        &'a self,
        url: &'a Url,
    ) -> BoxFuture<'a, Result<Box<dyn Connection>, TransportError>>;
}

pub trait Connection: Send {
    /// Writes the request and resolves with the response head. The returned
    /// body stream keeps the connection alive until it is drained or dropped.
    fn send(
        self: Box<Self>,
        head: RequestHead,
        body: OutboundBody,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>>;
}
