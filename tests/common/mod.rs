#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, stream};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqflow::TransportErrorKind;
use reqflow::transport::{
    Connection, OutboundBody, RequestHead, Transport, TransportError, TransportResponse,
};
use url::Url;

#[derive(Clone, Debug)]
pub struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    chunks: Vec<Bytes>,
}

impl Reply {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            chunks: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.chunks = vec![body.into()];
        self
    }

    /// Delivers the body in the given pieces.
    pub fn chunks<I, B>(mut self, chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.chunks = chunks.into_iter().map(Into::into).collect();
        self
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        Self::new(status).header("Location", location)
    }
}

#[derive(Clone, Debug)]
pub enum Step {
    Respond(Reply),
    Refuse,
    Reset,
    StallConnect,
    StallResponse,
}

/// What the transport saw for one request.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub method: Method,
    pub url: Url,
    /// Names as the engine spelled them, in write order.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Plays back a fixed script, one step per connection.
#[derive(Default)]
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    recorded: Arc<Mutex<Vec<Recorded>>>,
    connects: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            recorded: Arc::default(),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn replies(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
        Self::new(replies.into_iter().map(Step::Respond))
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.recorded.lock().expect("recorded lock").clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn connect<'a>(
        &'a self,
        _url: &'a Url,
    ) -> BoxFuture<'a, Result<Box<dyn Connection>, TransportError>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().expect("steps lock").pop_front();
        let recorded = Arc::clone(&self.recorded);
        Box::pin(async move {
            match step {
                None => Err(TransportError::new(
                    TransportErrorKind::Other,
                    "script exhausted",
                )),
                Some(Step::Refuse) => Err(TransportError::new(
                    TransportErrorKind::Connect,
                    io::Error::from(io::ErrorKind::ConnectionRefused),
                )),
                Some(Step::StallConnect) => std::future::pending().await,
                Some(step) => {
                    let connection: Box<dyn Connection> =
                        Box::new(ScriptedConnection { step, recorded });
                    Ok(connection)
                }
            }
        })
    }
}

struct ScriptedConnection {
    step: Step,
    recorded: Arc<Mutex<Vec<Recorded>>>,
}

impl Connection for ScriptedConnection {
    fn send(
        self: Box<Self>,
        head: RequestHead,
        body: OutboundBody,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        Box::pin(async move {
            let body = collect(body).await?;
            self.recorded.lock().expect("recorded lock").push(Recorded {
                method: head.method,
                url: head.url,
                headers: head
                    .headers
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.to_owned(),
                            value.to_str().unwrap_or_default().to_owned(),
                        )
                    })
                    .collect(),
                body,
            });

            match self.step {
                Step::Respond(reply) => Ok(into_response(reply)),
                Step::Reset => Err(TransportError::new(
                    TransportErrorKind::Reset,
                    io::Error::from(io::ErrorKind::ConnectionReset),
                )),
                Step::StallResponse => std::future::pending().await,
                Step::Refuse | Step::StallConnect => {
                    unreachable!("handled while connecting")
                }
            }
        })
    }
}

async fn collect(body: OutboundBody) -> Result<Bytes, TransportError> {
    match body {
        OutboundBody::Empty => Ok(Bytes::new()),
        OutboundBody::Buffered(bytes) => Ok(bytes),
        OutboundBody::Streaming(mut stream) => {
            let mut collected = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                let chunk =
                    chunk.map_err(|source| TransportError::new(TransportErrorKind::Other, source))?;
                collected.extend_from_slice(&chunk);
            }
            Ok(collected.freeze())
        }
    }
}

fn into_response(reply: Reply) -> TransportResponse {
    let mut headers = HeaderMap::new();
    for (name, value) in &reply.headers {
        headers.append(
            HeaderName::from_bytes(name.as_bytes()).expect("scripted header name"),
            HeaderValue::from_str(value).expect("scripted header value"),
        );
    }
    TransportResponse {
        status: StatusCode::from_u16(reply.status).expect("scripted status"),
        headers,
        body: stream::iter(reply.chunks.into_iter().map(Ok)).boxed(),
    }
}
