//! Ordered request/response stages.
//!
//! The request phase walks the stages front to back with an index cursor.
//! Only stages whose request phase completed take part in unwinding, which
//! runs back to front: the last stage to touch the request is the first to
//! see the response or the error.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use http::Method;
use tracing::{debug, warn};
use url::Url;

use crate::error::{BoxError, Error, ErrorKind};
use crate::headers::{HeaderBag, QueryParams};
use crate::request::RequestBody;
use crate::response::ResponseEnvelope;

/// Where in the lifecycle a stage is being invoked.
#[derive(Clone, Debug)]
pub struct RequestContext {
    method: Method,
    url: Url,
    attempt: usize,
    redirect_count: usize,
}

impl RequestContext {
    pub(crate) fn new(method: Method, url: Url, attempt: usize, redirect_count: usize) -> Self {
        Self {
            method,
            url,
            attempt,
            redirect_count,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// 1 for the first try, incremented on every retry.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Redirects already followed in the current attempt.
    pub fn redirect_count(&self) -> usize {
        self.redirect_count
    }
}

/// The parts of an in-flight request a stage may change.
pub struct AttemptRequest<'a> {
    pub(crate) method: &'a Method,
    pub(crate) url: &'a Url,
    pub(crate) headers: &'a mut HeaderBag,
    pub(crate) query: &'a mut QueryParams,
    pub(crate) body: &'a mut RequestBody,
}

impl AttemptRequest<'_> {
    pub fn method(&self) -> &Method {
        self.method
    }

    pub fn url(&self) -> &Url {
        self.url
    }

    pub fn headers(&self) -> &HeaderBag {
        self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderBag {
        self.headers
    }

    pub fn query_mut(&mut self) -> &mut QueryParams {
        self.query
    }

    pub fn body(&self) -> &RequestBody {
        self.body
    }

    pub fn body_mut(&mut self) -> &mut RequestBody {
        self.body
    }
}

/// A stage wrapped around every attempt.
///
/// `on_request` runs once per hop, so a followed redirect calls it again for
/// the next location. Intermediate 3xx responses are not shown to the
/// response phase: `on_response` or `on_error` runs once per attempt, for the
/// final response of the redirect chain or for the error that ended it.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Returning an error stops the request phase.
    fn on_request(
        &self,
        _context: &RequestContext,
        _request: &mut AttemptRequest<'_>,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_response(
        &self,
        _context: &RequestContext,
        _response: &mut ResponseEnvelope,
    ) -> Result<(), BoxError> {
        Ok(())
    }

    fn on_error(&self, _context: &RequestContext, _error: &Error) {}
}

#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_list()
            .entries(self.stages.iter().map(|stage| stage.name().to_owned()))
            .finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Arc<dyn Middleware>) {
        self.stages.push(stage);
    }

    pub fn extend(&mut self, other: &Pipeline) {
        self.stages.extend(other.stages.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs the request phase. The returned [`Unwind`] covers the stages that
    /// completed; the error, if any, is the one that stopped the walk.
    pub(crate) fn run_request(
        &self,
        context: &RequestContext,
        request: &mut AttemptRequest<'_>,
    ) -> (Unwind, Option<Error>) {
        let mut cursor = 0;
        while cursor < self.stages.len() {
            let stage = &self.stages[cursor];
            let outcome = catch_unwind(AssertUnwindSafe(|| stage.on_request(context, request)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(source)) => Some(source),
                Err(panic) => Some(panic_source(panic)),
            };
            if let Some(source) = failure {
                debug!(stage = stage.name(), "middleware stopped the request phase");
                let error = middleware_error(stage.name(), source);
                let unwind = Unwind {
                    entered: self.stages[..cursor].to_vec(),
                };
                return (unwind, Some(error));
            }
            cursor += 1;
        }
        let unwind = Unwind {
            entered: self.stages.clone(),
        };
        (unwind, None)
    }
}

/// Stages to revisit, in reverse, once the attempt has an outcome.
pub(crate) struct Unwind {
    entered: Vec<Arc<dyn Middleware>>,
}

impl Unwind {
    /// Response handlers, newest first. The first failure becomes the
    /// returned error and the remaining stages see it through `on_error`.
    pub(crate) fn response(
        &self,
        context: &RequestContext,
        response: &mut ResponseEnvelope,
    ) -> Result<(), Error> {
        for (position, stage) in self.entered.iter().enumerate().rev() {
            let outcome = catch_unwind(AssertUnwindSafe(|| stage.on_response(context, response)));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(source)) => source,
                Err(panic) => panic_source(panic),
            };
            let error = middleware_error(stage.name(), failure);
            notify_errors(&self.entered[..position], context, &error);
            return Err(error);
        }
        Ok(())
    }

    pub(crate) fn error(&self, context: &RequestContext, error: &Error) {
        notify_errors(&self.entered, context, error);
    }
}

fn notify_errors(stages: &[Arc<dyn Middleware>], context: &RequestContext, error: &Error) {
    for stage in stages.iter().rev() {
        if catch_unwind(AssertUnwindSafe(|| stage.on_error(context, error))).is_err() {
            warn!(stage = stage.name(), "middleware panicked in on_error; ignoring");
        }
    }
}

fn middleware_error(stage: &str, source: BoxError) -> Error {
    Error::from(ErrorKind::Middleware {
        stage: stage.to_owned(),
        source,
    })
}

fn panic_source(panic: Box<dyn Any + Send>) -> BoxError {
    let message = if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    };
    format!("panicked: {message}").into()
}
