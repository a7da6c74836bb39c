//! The request lifecycle.
//!
//! One logical call is a retry loop around a redirect loop around a single
//! attempt. Every attempt re-enters the middleware pipeline from the start and
//! re-arms the connect and response timers; the deadline is armed once per
//! call and bounds everything, backoff sleeps included.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, TryStreamExt};
use http::header::{CONTENT_TYPE, SET_COOKIE};
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};
use url::Url;

use crate::Result;
use crate::client::Client;
use crate::codec::APPLICATION_JSON;
use crate::config::{ClientConfig, StatusPolicy};
use crate::decompress::{
    BodyError, ContentCoding, inflate_stream, remove_content_encoding_headers, should_decode,
};
use crate::error::{BoxError, Error, ErrorKind, LifecycleMetadata};
use crate::middleware::{AttemptRequest, RequestContext};
use crate::redirect::{self, RedirectStep};
use crate::request::{RequestBody, RequestDescriptor};
use crate::response::{HeaderAccess, ResponseEnvelope, StatusInfo};
use crate::retry::{RetryDecision, retry_after};
use crate::timeout::{Deadline, TimedOut, TimeoutKind, race};
use crate::transport::{
    OutboundBody, RequestHead, ResponseStream, Transport, TransportError, TransportResponse,
};
use crate::util::{lock_unpoisoned, parse_header_value, redact_url_for_logs};

/// Counters shared between a running call and whoever may abort it.
#[derive(Debug)]
pub(crate) struct Progress {
    started: Instant,
    redirects: AtomicUsize,
    retries: AtomicUsize,
}

impl Progress {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
            redirects: AtomicUsize::new(0),
            retries: AtomicUsize::new(0),
        }
    }

    pub(crate) fn metadata(&self) -> LifecycleMetadata {
        LifecycleMetadata {
            redirects: self.redirects.load(Ordering::Acquire),
            retries: self.retries.load(Ordering::Acquire),
            elapsed: self.started.elapsed(),
        }
    }
}

/// Bookkeeping for one pass through the transport.
#[derive(Debug)]
struct LifecycleAttempt {
    attempt: usize,
    hop: usize,
    started: Instant,
    fired: Option<TimeoutKind>,
}

impl LifecycleAttempt {
    fn new(attempt: usize, hop: usize) -> Self {
        Self {
            attempt,
            hop,
            started: Instant::now(),
            fired: None,
        }
    }

    fn timed_out(&mut self, timed_out: TimedOut, method: &Method, url: &Url) -> Error {
        self.fired = Some(timed_out.kind);
        debug!(
            attempt = self.attempt,
            hop = self.hop,
            kind = timed_out.kind.as_str(),
            "timer fired"
        );
        Error::from(ErrorKind::Timeout {
            kind: timed_out.kind,
            elapsed_ms: timed_out.elapsed.as_millis(),
            method: method.clone(),
            url: redact_url_for_logs(url),
        })
    }

    fn completed(&self, status: StatusCode) {
        debug!(
            status = status.as_u16(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            timer = ?self.fired,
            "request completed"
        );
    }
}

enum Outcome {
    Complete(ResponseEnvelope),
    Redirect(RedirectStep),
}

type AttachmentSlot = Arc<Mutex<Option<Error>>>;

pub(crate) struct Engine<'a> {
    config: &'a ClientConfig,
    transport: &'a dyn Transport,
    progress: &'a Progress,
}

impl<'a> Engine<'a> {
    pub(crate) fn new(
        config: &'a ClientConfig,
        transport: &'a dyn Transport,
        progress: &'a Progress,
    ) -> Self {
        Self {
            config,
            transport,
            progress,
        }
    }

    /// Drives `original` to a terminal outcome. Errors leave here with the
    /// call's lifecycle metadata attached.
    pub(crate) async fn execute(&self, original: RequestDescriptor) -> Result<ResponseEnvelope> {
        let deadline = Deadline::start(original.timeouts.deadline_timeout());
        let policy = &original.retry_policy;
        let max_retries = policy.configured_max_retries();
        let mut attempt = 1;

        loop {
            let outcome = self.run_chain(&original, attempt, &deadline).await;
            if outcome
                .as_ref()
                .is_ok_and(|response| !response.is_server_error())
            {
                return outcome;
            }
            let url = redact_url_for_logs(&original.url);
            let (decision, retry_headers) = match &outcome {
                Ok(response) => (
                    RetryDecision::from_status(
                        response.status(),
                        attempt,
                        max_retries,
                        &original.method,
                        url,
                    ),
                    Some(response.headers()),
                ),
                Err(error) => (
                    RetryDecision::from_error(error, attempt, max_retries, &original.method, url),
                    error.response().map(|response| response.headers()),
                ),
            };

            let retries_done = attempt - 1;
            if retries_done >= max_retries || !policy.should_retry_decision(&decision) {
                return self.finish(outcome);
            }

            let requested = retry_headers.and_then(|headers| retry_after(headers, SystemTime::now()));
            let delay = match requested {
                Some(requested) if deadline.is_unbounded() => {
                    let capped = policy.cap_server_delay(requested);
                    if capped < requested {
                        debug!(
                            requested_ms = requested.as_millis() as u64,
                            capped_ms = capped.as_millis() as u64,
                            "capping retry-after without a deadline"
                        );
                    }
                    capped
                }
                Some(requested) => requested,
                None => policy.backoff_for_retry(attempt),
            };
            let Some(delay) = deadline.bounded_delay(delay) else {
                debug!("retry backoff would outlive the deadline");
                return self.finish(outcome);
            };

            match &outcome {
                Err(error) => warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying request"
                ),
                Ok(response) => warn!(
                    attempt,
                    status = response.status().as_u16(),
                    delay_ms = delay.as_millis() as u64,
                    "retrying request after server error"
                ),
            }
            drop(outcome);
            self.progress.retries.fetch_add(1, Ordering::AcqRel);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }

    fn finish(&self, outcome: Result<ResponseEnvelope>) -> Result<ResponseEnvelope> {
        outcome.map_err(|error| error.with_metadata(self.progress.metadata()))
    }

    /// Follows redirects starting from a fresh clone of `original`.
    async fn run_chain(
        &self,
        original: &RequestDescriptor,
        attempt: usize,
        deadline: &Deadline,
    ) -> Result<ResponseEnvelope> {
        let mut hop = original.clone();
        let mut chain: Vec<Url> = Vec::new();
        self.progress.redirects.store(0, Ordering::Release);

        loop {
            let span = info_span!(
                "reqflow.request",
                method = %hop.method,
                url = %redact_url_for_logs(&hop.url),
                attempt = attempt,
                hop = chain.len()
            );
            let outcome = self
                .run_attempt(&hop, attempt, &chain, deadline)
                .instrument(span)
                .await?;
            match outcome {
                Outcome::Complete(envelope) => return Ok(envelope),
                Outcome::Redirect(step) => {
                    debug!(
                        location = %redact_url_for_logs(&step.url),
                        method = %step.method,
                        cross_origin = step.cross_origin,
                        "following redirect"
                    );
                    redirect::apply(&mut hop, &step);
                    chain.push(step.url);
                    self.progress.redirects.store(chain.len(), Ordering::Release);
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        hop: &RequestDescriptor,
        attempt: usize,
        chain: &[Url],
        deadline: &Deadline,
    ) -> Result<Outcome> {
        let mut working = hop.clone();
        let context =
            RequestContext::new(working.method.clone(), working.url.clone(), attempt, chain.len());

        let (unwind, failure) = {
            let mut view = AttemptRequest {
                method: &working.method,
                url: &working.url,
                headers: &mut working.headers,
                query: &mut working.query,
                body: &mut working.body,
            };
            working.middleware.run_request(&context, &mut view)
        };
        if let Some(error) = failure {
            unwind.error(&context, &error);
            return Err(error);
        }

        let method = working.method.clone();
        let status_policy = working.status_policy;
        let mut lifecycle = LifecycleAttempt::new(attempt, chain.len());
        let mut envelope = match self
            .transmit(working, &mut lifecycle, chain, deadline)
            .await
        {
            Ok(Outcome::Complete(envelope)) => envelope,
            Ok(redirect @ Outcome::Redirect(_)) => return Ok(redirect),
            Err(error) => {
                unwind.error(&context, &error);
                return Err(error);
            }
        };

        unwind.response(&context, &mut envelope)?;

        if status_policy == StatusPolicy::Error && envelope.is_error() {
            return Err(Error::from(ErrorKind::Status {
                status: envelope.status().as_u16(),
                method,
                url: redact_url_for_logs(envelope.url()),
                response: Box::new(envelope),
            }));
        }
        if envelope.is_ok() {
            envelope.body()?;
        }
        Ok(Outcome::Complete(envelope))
    }

    /// Everything between the middleware request phase and the response
    /// phase: cookies, body preparation, the wire exchange and the body read.
    async fn transmit(
        &self,
        mut working: RequestDescriptor,
        lifecycle: &mut LifecycleAttempt,
        chain: &[Url],
        deadline: &Deadline,
    ) -> Result<Outcome> {
        let url = working.query.apply_to(&working.url);
        let method = working.method.clone();

        if let Some(jar) = self.config.cookie_jar()
            && let Some(stored) = jar.cookie_header(&url)
        {
            let combined = match working.headers.get("cookie") {
                Some(existing) if !existing.is_empty() => format!("{existing}; {stored}"),
                _ => stored,
            };
            working.headers.insert("Cookie", &combined)?;
        }

        let (body, attachment) = self.prepare_body(&mut working)?;

        if deadline.is_exhausted() {
            let timed_out = TimedOut {
                kind: TimeoutKind::Deadline,
                elapsed: deadline.elapsed(),
            };
            return Err(lifecycle.timed_out(timed_out, &method, &url));
        }

        let connection = match race(
            TimeoutKind::Connect,
            working.timeouts.connect_timeout(),
            deadline,
            self.transport.connect(&url),
        )
        .await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(error)) => return Err(transport_error(error, &method, &url)),
            Err(timed_out) => return Err(lifecycle.timed_out(timed_out, &method, &url)),
        };

        debug!("sending request");
        let head = RequestHead {
            method: method.clone(),
            url: url.clone(),
            headers: working.headers,
        };
        let sent = race(
            TimeoutKind::Response,
            working.timeouts.response_timeout(),
            deadline,
            connection.send(head, body),
        )
        .await;
        if let Some(error) = take_attachment_error(attachment.as_ref()) {
            return Err(error);
        }
        let TransportResponse {
            status,
            mut headers,
            body,
        } = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => return Err(transport_error(error, &method, &url)),
            Err(timed_out) => return Err(lifecycle.timed_out(timed_out, &method, &url)),
        };

        self.store_cookies(&headers, &url);

        if let Some(step) = redirect::evaluate(
            working.redirect_policy,
            status,
            &headers,
            &method,
            &url,
            chain.len(),
        )
        .map_err(Error::from)?
        {
            return Ok(Outcome::Redirect(step));
        }

        let coding = if self.config.decompress() && should_decode(&method, status, &headers) {
            ContentCoding::from_headers(&headers)
        } else {
            None
        };
        let payload = match race(TimeoutKind::Deadline, None, deadline, read_body(body, coding))
            .await
        {
            Ok(Ok(payload)) => payload,
            Ok(Err(BodyError::Transport(error))) => {
                return Err(transport_error(error, &method, &url));
            }
            Ok(Err(BodyError::Decode(failure))) => {
                return Err(Error::from(ErrorKind::Decode {
                    encoding: failure.encoding.to_owned(),
                    message: failure.message,
                }));
            }
            Err(timed_out) => return Err(lifecycle.timed_out(timed_out, &method, &url)),
        };
        if coding.is_some() {
            remove_content_encoding_headers(&mut headers);
        }
        lifecycle.completed(status);

        let parser = match working.parser {
            Some(parser) => parser,
            None => self.config.codecs().parser_for(
                headers
                    .get(CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok()),
            ),
        };
        Ok(Outcome::Complete(ResponseEnvelope::new(
            status,
            headers,
            payload,
            url,
            chain.to_vec(),
            parser,
        )))
    }

    /// Turns the request body into wire form. Multipart bodies report file
    /// errors through the returned slot since the transport only sees an
    /// opaque stream failure.
    fn prepare_body(
        &self,
        working: &mut RequestDescriptor,
    ) -> Result<(OutboundBody, Option<AttachmentSlot>)> {
        match &working.body {
            RequestBody::Empty => Ok((OutboundBody::Empty, None)),
            RequestBody::Bytes(bytes) => Ok((OutboundBody::Buffered(bytes.clone()), None)),
            RequestBody::Structured(value) => {
                let content_type = working
                    .headers
                    .get(CONTENT_TYPE.as_str())
                    .unwrap_or(APPLICATION_JSON)
                    .to_owned();
                let serializer = working
                    .serializer
                    .clone()
                    .or_else(|| self.config.codecs().serializer_for(&content_type))
                    .ok_or_else(|| {
                        Error::from(ErrorKind::Serialize {
                            content_type: content_type.clone(),
                            source: format!("no serializer registered for {content_type}").into(),
                        })
                    })?;
                let bytes = serializer.serialize(value).map_err(|source| {
                    Error::from(ErrorKind::Serialize {
                        content_type: content_type.clone(),
                        source,
                    })
                })?;
                if !working.headers.contains(CONTENT_TYPE.as_str()) {
                    working
                        .headers
                        .insert_typed(CONTENT_TYPE, http::HeaderValue::from_static(APPLICATION_JSON));
                }
                Ok((OutboundBody::Buffered(bytes), None))
            }
            RequestBody::Multipart(form) => {
                let content_type = parse_header_value(CONTENT_TYPE.as_str(), &form.content_type())?;
                let slot: AttachmentSlot = Arc::new(Mutex::new(None));
                let writer = Arc::clone(&slot);
                let stream = form
                    .encode()
                    .map(move |chunk| {
                        chunk.map_err(|error| {
                            let message: BoxError = error.to_string().into();
                            *lock_unpoisoned(&writer) = Some(error);
                            message
                        })
                    })
                    .boxed();
                working.headers.insert_typed(CONTENT_TYPE, content_type);
                Ok((OutboundBody::Streaming(stream), Some(slot)))
            }
        }
    }

    fn store_cookies(&self, headers: &HeaderMap, url: &Url) {
        let Some(jar) = self.config.cookie_jar() else {
            return;
        };
        let mut values = Vec::new();
        for value in headers.get_all(SET_COOKIE) {
            match value.to_str() {
                Ok(value) => values.push(value),
                Err(_) => warn!("dropping non-utf8 set-cookie header"),
            }
        }
        if values.is_empty() {
            return;
        }
        let offered = values.len();
        let stored = jar.set_cookies(values, url);
        if stored < offered {
            warn!(
                offered,
                stored,
                url = %redact_url_for_logs(url),
                "dropped cookies that could not be stored"
            );
        }
    }
}

async fn read_body(
    body: ResponseStream,
    coding: Option<ContentCoding>,
) -> std::result::Result<Bytes, BodyError> {
    let mut stream = match coding {
        Some(coding) => inflate_stream(body, coding),
        None => body.map_err(BodyError::Transport).boxed(),
    };
    let mut collected = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk?);
    }
    Ok(collected.freeze())
}

fn take_attachment_error(slot: Option<&AttachmentSlot>) -> Option<Error> {
    slot.and_then(|slot| lock_unpoisoned(slot).take())
}

fn transport_error(error: TransportError, method: &Method, url: &Url) -> Error {
    Error::from(ErrorKind::Transport {
        kind: error.kind(),
        method: method.clone(),
        url: redact_url_for_logs(url),
        source: error.into_source(),
    })
}

/// A request running on its own task.
///
/// Awaiting a `Call` yields the terminal outcome. [`Call::abort`] (or
/// dropping the call) cancels it: in-flight I/O is dropped and the outcome
/// becomes [`ErrorKind::Aborted`], unless a result was already delivered.
#[derive(Debug)]
pub struct Call {
    receiver: oneshot::Receiver<Result<ResponseEnvelope>>,
    cancel: CancellationToken,
    progress: Arc<Progress>,
}

impl Call {
    pub(crate) fn spawn(client: Client, descriptor: RequestDescriptor) -> Self {
        let (sender, receiver) = oneshot::channel();
        let cancel = CancellationToken::new();
        let progress = Arc::new(Progress::new());

        let token = cancel.clone();
        let task_progress = Arc::clone(&progress);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(aborted(&task_progress)),
                outcome = client.run(descriptor, &task_progress) => outcome,
            };
            if sender.send(outcome).is_err() {
                debug!("call outcome dropped; receiver is gone");
            }
        });

        Self {
            receiver,
            cancel,
            progress,
        }
    }

    /// A call that has already failed, used when the request cannot be built.
    pub(crate) fn failed(error: Error) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(Err(error));
        Self {
            receiver,
            cancel: CancellationToken::new(),
            progress: Arc::new(Progress::new()),
        }
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            token: self.cancel.clone(),
        }
    }

    /// Redirects and retries so far.
    pub fn metadata(&self) -> LifecycleMetadata {
        self.progress.metadata()
    }

    /// Hands the outcome to `callback` from a background task. The call keeps
    /// running until it finishes or the returned handle aborts it.
    pub fn end<F>(self, callback: F) -> AbortHandle
    where
        F: FnOnce(Result<ResponseEnvelope>) + Send + 'static,
    {
        let handle = self.abort_handle();
        tokio::spawn(async move {
            callback(self.await);
        });
        handle
    }
}

impl Future for Call {
    type Output = Result<ResponseEnvelope>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(aborted(&self.progress))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Cancels a [`Call`] from anywhere, including after it was handed to
/// [`Call::end`].
#[derive(Clone, Debug)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

fn aborted(progress: &Progress) -> Error {
    Error::from(ErrorKind::Aborted).with_metadata(progress.metadata())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Progress;

    #[tokio::test(start_paused = true)]
    async fn progress_reports_counters_and_elapsed_time() {
        let progress = Progress::new();
        progress
            .retries
            .fetch_add(2, std::sync::atomic::Ordering::AcqRel);
        progress
            .redirects
            .store(1, std::sync::atomic::Ordering::Release);
        tokio::time::advance(Duration::from_millis(250)).await;

        let metadata = progress.metadata();
        assert_eq!(metadata.retries, 2);
        assert_eq!(metadata.redirects, 1);
        assert_eq!(metadata.elapsed, Duration::from_millis(250));
    }
}
