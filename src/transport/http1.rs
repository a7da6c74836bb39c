use std::convert::Infallible;
use std::future::poll_fn;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt, TryStreamExt};
use http::header::HOST;
use http::{HeaderValue, Request, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::client::conn::http1;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use tokio::task::JoinHandle;
use tower_service::Service;
use tracing::debug;
use url::{Position, Url};

use super::{Connection, OutboundBody, RequestHead, Transport, TransportError, TransportResponse};
use crate::error::{BoxError, TransportErrorKind};

type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

/// HTTP/1.1 over plain TCP or rustls, one fresh connection per attempt.
#[derive(Clone, Debug)]
pub struct HyperTransport {
    connector: HttpsConnector<HttpConnector>,
}

impl HyperTransport {
    pub fn new() -> Result<Self, TransportError> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        let connector = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| TransportError::new(TransportErrorKind::Tls, source))?
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);
        Ok(Self { connector })
    }
}

impl Transport for HyperTransport {
    fn connect<'a>(
        &'a self,
        url: &'a Url,
    ) -> BoxFuture<'a, Result<Box<dyn Connection>, TransportError>> {
        async move {
            let uri: Uri = url
                .as_str()
                .parse()
                .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;
            let mut connector = self.connector.clone();
            poll_fn(|cx| connector.poll_ready(cx))
                .await
                .map_err(TransportError::from_source)?;
            let io = connector
                .call(uri)
                .await
                .map_err(TransportError::from_source)?;
            let (sender, driver) = http1::handshake::<_, RequestBody>(io)
                .await
                .map_err(TransportError::from_source)?;
            let driver = tokio::spawn(async move {
                if let Err(error) = driver.await {
                    debug!(error = %error, "http1 connection closed with error");
                }
            });
            Ok(Box::new(HyperConnection {
                sender,
                driver: DriverGuard(driver),
            }) as Box<dyn Connection>)
        }
        .boxed()
    }
}

/// Aborts the connection driver task once the response body is gone.
struct DriverGuard(JoinHandle<()>);

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct HyperConnection {
    sender: http1::SendRequest<RequestBody>,
    driver: DriverGuard,
}

impl Connection for HyperConnection {
    fn send(
        self: Box<Self>,
        head: RequestHead,
        body: OutboundBody,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        let HyperConnection { mut sender, driver } = *self;
        async move {
            let request = build_request(&head, body)?;
            poll_fn(|cx| sender.poll_ready(cx))
                .await
                .map_err(TransportError::from_source)?;
            let response = sender
                .send_request(request)
                .await
                .map_err(TransportError::from_source)?;
            let (parts, incoming) = response.into_parts();

            let body = TryStreamExt::map_err(BodyStream::new(incoming), |error| {
                let error = TransportError::from_source(error);
                match error.kind() {
                    TransportErrorKind::Other => {
                        TransportError::new(TransportErrorKind::Read, error.into_source())
                    }
                    _ => error,
                }
            })
            .try_filter_map(|frame| async move { Ok(frame.into_data().ok()) })
            .map(move |chunk| {
                let _connection = &driver;
                chunk
            })
            .boxed();

            Ok(TransportResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        }
        .boxed()
    }
}

fn build_request(
    head: &RequestHead,
    body: OutboundBody,
) -> Result<Request<RequestBody>, TransportError> {
    let target = &head.url[Position::BeforePath..Position::AfterQuery];
    let target = if target.is_empty() { "/" } else { target };

    let mut request = Request::builder()
        .method(head.method.clone())
        .uri(target)
        .body(outbound_body(body))
        .map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;

    let headers = request.headers_mut();
    for (name, value) in head.headers.as_map() {
        headers.append(name.clone(), value.clone());
    }
    if !headers.contains_key(HOST) {
        let host = host_header(&head.url)
            .ok_or_else(|| TransportError::new(TransportErrorKind::Other, "url has no host"))?;
        headers.insert(HOST, host);
    }
    Ok(request)
}

fn host_header(url: &Url) -> Option<HeaderValue> {
    let host = url.host_str()?;
    let value = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };
    HeaderValue::from_str(&value).ok()
}

fn outbound_body(body: OutboundBody) -> RequestBody {
    match body {
        OutboundBody::Empty => Empty::<Bytes>::new()
            .map_err(|never: Infallible| -> BoxError { match never {} })
            .boxed_unsync(),
        OutboundBody::Buffered(bytes) => Full::new(bytes)
            .map_err(|never: Infallible| -> BoxError { match never {} })
            .boxed_unsync(),
        OutboundBody::Streaming(stream) => StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync(),
    }
}
