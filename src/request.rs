use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::Method;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::Result;
use crate::client::Client;
use crate::codec::{APPLICATION_FORM, APPLICATION_JSON, BodyParser, BodySerializer, TEXT_PLAIN};
use crate::config::StatusPolicy;
use crate::engine::{AbortHandle, Call};
use crate::error::{Error, ErrorKind};
use crate::headers::{HeaderBag, QueryParams};
use crate::middleware::{Middleware, Pipeline};
use crate::multipart::MultipartForm;
use crate::redirect::RedirectPolicy;
use crate::response::ResponseEnvelope;
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutSettings;
use crate::util::{parse_header_value, resolve_url};

#[derive(Clone, Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Bytes),
    /// Serialized per attempt by the codec registered for the request's
    /// content type.
    Structured(Value),
    Multipart(MultipartForm),
}

impl RequestBody {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Bytes(bytes) => bytes.is_empty(),
            Self::Structured(_) => false,
            Self::Multipart(form) => form.is_empty(),
        }
    }
}

/// A fully configured request. Each redirect hop and each retry works on its
/// own clone; byte bodies share their buffer.
#[derive(Clone)]
pub struct RequestDescriptor {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderBag,
    pub(crate) query: QueryParams,
    pub(crate) body: RequestBody,
    pub(crate) timeouts: TimeoutSettings,
    pub(crate) redirect_policy: RedirectPolicy,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) status_policy: StatusPolicy,
    pub(crate) serializer: Option<Arc<dyn BodySerializer>>,
    pub(crate) parser: Option<Arc<dyn BodyParser>>,
    pub(crate) middleware: Pipeline,
}

impl RequestDescriptor {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Target without the query pairs added through the builder.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderBag {
        &self.headers
    }

    pub fn query(&self) -> &QueryParams {
        &self.query
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn timeouts(&self) -> TimeoutSettings {
        self.timeouts
    }

    pub fn redirect_policy(&self) -> RedirectPolicy {
        self.redirect_policy
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn status_policy(&self) -> StatusPolicy {
        self.status_policy
    }
}

impl std::fmt::Debug for RequestDescriptor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestDescriptor")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("query", &self.query)
            .field("body", &self.body)
            .field("timeouts", &self.timeouts)
            .field("redirect_policy", &self.redirect_policy)
            .field("retry_policy", &self.retry_policy)
            .field("status_policy", &self.status_policy)
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

pub struct RequestBuilder {
    client: Client,
    method: Method,
    target: String,
    headers: HeaderBag,
    query: QueryParams,
    body: RequestBody,
    timeouts: TimeoutSettings,
    retry_policy: Option<RetryPolicy>,
    max_retries: Option<usize>,
    redirect_policy: Option<RedirectPolicy>,
    status_policy: Option<StatusPolicy>,
    serializer: Option<Arc<dyn BodySerializer>>,
    parser: Option<Arc<dyn BodyParser>>,
    middleware: Pipeline,
}

impl RequestBuilder {
    pub(crate) fn new(client: Client, method: Method, target: String) -> Self {
        Self {
            client,
            method,
            target,
            headers: HeaderBag::new(),
            query: QueryParams::new(),
            body: RequestBody::Empty,
            timeouts: TimeoutSettings::new(),
            retry_policy: None,
            max_retries: None,
            redirect_policy: None,
            status_policy: None,
            serializer: None,
            parser: None,
            middleware: Pipeline::new(),
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert_typed(name, value);
        self
    }

    /// Keeps the spelling of `name` for the first write of that header.
    pub fn try_header(mut self, name: &str, value: &str) -> Result<Self> {
        self.headers.insert(name, value)?;
        Ok(self)
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push(name, value);
        self
    }

    pub fn query_pairs<K, V, I>(mut self, pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        self.query.extend_pairs(pairs);
        self
    }

    pub fn query<T>(mut self, params: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        self.query.push_serialized(params)?;
        Ok(self)
    }

    /// Appended to the query string exactly as given.
    pub fn query_raw(mut self, raw: impl Into<String>) -> Self {
        self.query.push_raw(raw);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = RequestBody::Bytes(body.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.body = RequestBody::Bytes(Bytes::from(text.into()));
        self.headers
            .insert_default(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
        self
    }

    /// Sends `payload` as JSON. A content type set earlier (for example a
    /// vendor `+json` type) is kept.
    pub fn json<T>(self, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let value = to_value(payload, APPLICATION_JSON)?;
        Ok(self.structured_with_default(value, APPLICATION_JSON))
    }

    pub fn form<T>(self, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let value = to_value(payload, APPLICATION_FORM)?;
        Ok(self.structured_with_default(value, APPLICATION_FORM))
    }

    /// A structured body serialized by whichever codec is registered for
    /// `content_type`.
    pub fn structured(mut self, content_type: &str, value: Value) -> Result<Self> {
        let header_value = parse_header_value(CONTENT_TYPE.as_str(), content_type)?;
        self.headers.insert_typed(CONTENT_TYPE, header_value);
        self.body = RequestBody::Structured(value);
        Ok(self)
    }

    fn structured_with_default(mut self, value: Value, content_type: &'static str) -> Self {
        self.headers
            .insert_default(CONTENT_TYPE, HeaderValue::from_static(content_type));
        self.body = RequestBody::Structured(value);
        self
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.body = RequestBody::Multipart(form);
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutSettings) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.timeouts = self.timeouts.connect(connect_timeout);
        self
    }

    pub fn response_timeout(mut self, response_timeout: Duration) -> Self {
        self.timeouts = self.timeouts.response(response_timeout);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.timeouts = self.timeouts.deadline(deadline);
        self
    }

    pub fn retries(mut self, max_retries: usize) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn redirects(mut self, max_redirects: usize) -> Self {
        self.redirect_policy = Some(RedirectPolicy::limited(max_redirects));
        self
    }

    pub fn redirect_policy(mut self, redirect_policy: RedirectPolicy) -> Self {
        self.redirect_policy = Some(redirect_policy);
        self
    }

    pub fn status_policy(mut self, status_policy: StatusPolicy) -> Self {
        self.status_policy = Some(status_policy);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn BodySerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn parser(mut self, parser: Arc<dyn BodyParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Runs after the client's own stages.
    pub fn middleware_arc(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn middleware<M>(self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.middleware_arc(Arc::new(middleware))
    }

    /// Resolves the target and folds in the client's defaults.
    pub fn build(self) -> Result<RequestDescriptor> {
        let (_, descriptor) = self.into_parts()?;
        Ok(descriptor)
    }

    fn into_parts(self) -> Result<(Client, RequestDescriptor)> {
        let config = self.client.config();
        let url = resolve_url(config.base_url(), &self.target)?;

        let mut headers = self.headers;
        headers.merge_defaults(config.default_headers());

        let mut retry_policy = self
            .retry_policy
            .unwrap_or_else(|| config.retry_policy().clone());
        if let Some(max_retries) = self.max_retries {
            retry_policy = retry_policy.max_retries(max_retries);
        }

        let mut middleware = config.middleware().clone();
        middleware.extend(&self.middleware);

        let descriptor = RequestDescriptor {
            method: self.method,
            url,
            headers,
            query: self.query,
            body: self.body,
            timeouts: self.timeouts.or(config.timeouts()),
            redirect_policy: self.redirect_policy.unwrap_or(config.redirect_policy()),
            retry_policy,
            status_policy: self.status_policy.unwrap_or(config.status_policy()),
            serializer: self.serializer,
            parser: self.parser,
            middleware,
        };
        Ok((self.client, descriptor))
    }

    /// Runs the request on the current task.
    pub async fn send(self) -> Result<ResponseEnvelope> {
        let (client, descriptor) = self.into_parts()?;
        client.execute(descriptor).await
    }

    /// Runs the request on its own task; the returned [`Call`] can be
    /// awaited, aborted, or turned into a callback.
    pub fn start(self) -> Call {
        match self.into_parts() {
            Ok((client, descriptor)) => Call::spawn(client, descriptor),
            Err(error) => Call::failed(error),
        }
    }

    /// Starts the request and hands the outcome to `callback`.
    pub fn end<F>(self, callback: F) -> AbortHandle
    where
        F: FnOnce(Result<ResponseEnvelope>) + Send + 'static,
    {
        self.start().end(callback)
    }
}

impl IntoFuture for RequestBuilder {
    type Output = Result<ResponseEnvelope>;
    type IntoFuture = BoxFuture<'static, Result<ResponseEnvelope>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.send())
    }
}

fn to_value<T>(payload: &T, content_type: &str) -> Result<Value>
where
    T: Serialize + ?Sized,
{
    serde_json::to_value(payload).map_err(|source| {
        Error::from(ErrorKind::Serialize {
            content_type: content_type.to_owned(),
            source: Box::new(source),
        })
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::Method;
    use serde_json::json;

    use super::RequestBody;
    use crate::Client;
    use crate::config::StatusPolicy;
    use crate::error::ErrorCode;

    fn client() -> Client {
        Client::builder()
            .base_url("http://api.test/v1")
            .try_default_header("X-Client", "reqflow-tests")
            .expect("header should be valid")
            .max_retries(1)
            .deadline(Duration::from_secs(9))
            .transport(crate::test_support::unreachable_transport())
            .build()
    }

    #[test]
    fn build_resolves_target_and_merges_client_defaults() {
        let descriptor = client()
            .post("/items")
            .try_header("x-client", "override")
            .expect("header should be valid")
            .response_timeout(Duration::from_millis(50))
            .status_policy(StatusPolicy::Response)
            .build()
            .expect("request should build");

        assert_eq!(descriptor.method(), &Method::POST);
        assert_eq!(descriptor.url().as_str(), "http://api.test/v1/items");
        assert_eq!(descriptor.headers().get("X-Client"), Some("override"));
        assert_eq!(
            descriptor.timeouts().response_timeout(),
            Some(Duration::from_millis(50))
        );
        assert_eq!(
            descriptor.timeouts().deadline_timeout(),
            Some(Duration::from_secs(9))
        );
        assert_eq!(descriptor.retry_policy().configured_max_retries(), 1);
        assert_eq!(descriptor.status_policy(), StatusPolicy::Response);
    }

    #[test]
    fn json_keeps_an_explicit_vendor_content_type() {
        let descriptor = client()
            .post("/items")
            .try_header("Content-Type", "application/vnd.api+json")
            .expect("header should be valid")
            .json(&json!({ "id": 1 }))
            .expect("json should serialize")
            .build()
            .expect("request should build");

        assert_eq!(
            descriptor.headers().get("content-type"),
            Some("application/vnd.api+json")
        );
        assert!(matches!(descriptor.body(), RequestBody::Structured(_)));
    }

    #[test]
    fn form_and_text_set_default_content_types() {
        let descriptor = client()
            .put("/items/1")
            .form(&[("name", "a b")])
            .expect("form should serialize")
            .build()
            .expect("request should build");
        assert_eq!(
            descriptor.headers().get("content-type"),
            Some("application/x-www-form-urlencoded")
        );

        let descriptor = client()
            .put("/notes")
            .text("hello")
            .build()
            .expect("request should build");
        assert_eq!(descriptor.headers().get("content-type"), Some("text/plain"));
    }

    #[test]
    fn relative_target_without_base_url_is_invalid() {
        let client = Client::builder()
            .transport(crate::test_support::unreachable_transport())
            .build();
        let error = client
            .get("/items")
            .build()
            .expect_err("relative target needs a base url");
        assert_eq!(error.code(), ErrorCode::InvalidUrl);
    }
}
