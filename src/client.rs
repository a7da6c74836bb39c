use std::sync::Arc;
use std::time::Duration;

use http::Method;
use http::header::{ACCEPT_ENCODING, HeaderName, HeaderValue, USER_AGENT};

use crate::Result;
use crate::codec::{BodyParser, BodySerializer, CodecRegistry};
use crate::config::{ClientConfig, ClientProfile, StatusPolicy};
use crate::cookie::CookieJar;
use crate::engine::{Engine, Progress};
use crate::error::{Error, ErrorKind};
use crate::middleware::Middleware;
use crate::redirect::RedirectPolicy;
use crate::request::{RequestBuilder, RequestDescriptor};
use crate::response::ResponseEnvelope;
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutSettings;
use crate::transport::Transport;
use crate::util::parse_header_value;

const DEFAULT_USER_AGENT: &str = concat!("reqflow/", env!("CARGO_PKG_VERSION"));
const SUPPORTED_ENCODINGS: &str = "gzip, deflate";

pub struct ClientBuilder {
    config: ClientConfig,
    user_agent: Option<HeaderValue>,
    transport: Option<Arc<dyn Transport>>,
}

impl ClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            user_agent: None,
            transport: None,
        }
    }

    /// Resets timeouts and policies to the preset. Call it before any
    /// individual setter it should not override.
    pub fn profile(mut self, profile: ClientProfile) -> Self {
        let defaults = profile.defaults();
        self.config.timeouts = defaults.timeouts;
        self.config.retry_policy = defaults.retry_policy;
        self.config.redirect_policy = defaults.redirect_policy;
        self.config.status_policy = defaults.status_policy;
        self
    }

    /// Relative request targets are joined onto this url.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = Some(base_url.into());
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config.default_headers.insert_typed(name, value);
        self
    }

    pub fn try_default_header(mut self, name: &str, value: &str) -> Result<Self> {
        self.config.default_headers.insert(name, value)?;
        Ok(self)
    }

    pub fn user_agent(mut self, user_agent: &str) -> Result<Self> {
        self.user_agent = Some(parse_header_value(USER_AGENT.as_str(), user_agent)?);
        Ok(self)
    }

    pub fn timeouts(mut self, timeouts: TimeoutSettings) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.config.timeouts = self.config.timeouts.connect(connect_timeout);
        self
    }

    pub fn response_timeout(mut self, response_timeout: Duration) -> Self {
        self.config.timeouts = self.config.timeouts.response(response_timeout);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.config.timeouts = self.config.timeouts.deadline(deadline);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.config.retry_policy = retry_policy;
        self
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.config.retry_policy = self.config.retry_policy.max_retries(max_retries);
        self
    }

    pub fn redirect_policy(mut self, redirect_policy: RedirectPolicy) -> Self {
        self.config.redirect_policy = redirect_policy;
        self
    }

    pub fn status_policy(mut self, status_policy: StatusPolicy) -> Self {
        self.config.status_policy = status_policy;
        self
    }

    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.config.codecs = codecs;
        self
    }

    pub fn serializer(mut self, mime: &str, serializer: Arc<dyn BodySerializer>) -> Self {
        self.config.codecs.set_serializer(mime, serializer);
        self
    }

    pub fn parser(mut self, mime: &str, parser: Arc<dyn BodyParser>) -> Self {
        self.config.codecs.set_parser(mime, parser);
        self
    }

    pub fn middleware_arc(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.config.middleware.push(middleware);
        self
    }

    pub fn middleware<M>(self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.middleware_arc(Arc::new(middleware))
    }

    /// Shares `jar` with this client; other clients holding the same jar see
    /// each other's cookies.
    pub fn cookie_jar(mut self, jar: Arc<CookieJar>) -> Self {
        self.config.cookie_jar = Some(jar);
        self
    }

    /// Gives the client a private jar, or removes any jar.
    pub fn cookie_store(mut self, enabled: bool) -> Self {
        self.config.cookie_jar = enabled.then(|| Arc::new(CookieJar::new()));
        self
    }

    pub fn decompress(mut self, enabled: bool) -> Self {
        self.config.decompress = enabled;
        self
    }

    /// Replaces the default hyper transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn try_build(self) -> Result<Client> {
        let mut config = self.config;
        let user_agent = self
            .user_agent
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_USER_AGENT));
        config.default_headers.insert_default(USER_AGENT, user_agent);
        if config.decompress {
            config
                .default_headers
                .insert_default(ACCEPT_ENCODING, HeaderValue::from_static(SUPPORTED_ENCODINGS));
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };
        Ok(Client {
            inner: Arc::new(ClientInner { config, transport }),
        })
    }

    #[track_caller]
    pub fn build(self) -> Client {
        self.try_build().unwrap_or_else(|error| {
            panic!(
                "failed to build reqflow client: {error}; use try_build() to handle configuration errors"
            )
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "hyper-transport")]
fn default_transport() -> Result<Arc<dyn Transport>> {
    let transport = crate::transport::HyperTransport::new().map_err(|error| {
        Error::from(ErrorKind::TransportInit {
            source: error.into_source(),
        })
    })?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "hyper-transport"))]
fn default_transport() -> Result<Arc<dyn Transport>> {
    Err(Error::from(ErrorKind::TransportInit {
        source: "no transport configured and the hyper-transport feature is disabled".into(),
    }))
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
}

/// Cheap to clone; clones share configuration, transport and cookie jar.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// `target` is either an absolute http(s) url or a path joined onto the
    /// base url.
    pub fn request(&self, method: Method, target: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, target.into())
    }

    pub fn get(&self, target: impl Into<String>) -> RequestBuilder {
        self.request(Method::GET, target)
    }

    pub fn post(&self, target: impl Into<String>) -> RequestBuilder {
        self.request(Method::POST, target)
    }

    pub fn put(&self, target: impl Into<String>) -> RequestBuilder {
        self.request(Method::PUT, target)
    }

    pub fn patch(&self, target: impl Into<String>) -> RequestBuilder {
        self.request(Method::PATCH, target)
    }

    pub fn delete(&self, target: impl Into<String>) -> RequestBuilder {
        self.request(Method::DELETE, target)
    }

    pub fn head(&self, target: impl Into<String>) -> RequestBuilder {
        self.request(Method::HEAD, target)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn cookie_jar(&self) -> Option<&Arc<CookieJar>> {
        self.inner.config.cookie_jar()
    }

    /// Runs an already built descriptor on the current task.
    pub async fn execute(&self, descriptor: RequestDescriptor) -> Result<ResponseEnvelope> {
        let progress = Progress::new();
        self.run(descriptor, &progress).await
    }

    pub(crate) async fn run(
        &self,
        descriptor: RequestDescriptor,
        progress: &Progress,
    ) -> Result<ResponseEnvelope> {
        let inner = &self.inner;
        Engine::new(&inner.config, inner.transport.as_ref(), progress)
            .execute(descriptor)
            .await
    }
}
