use http::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, LOCATION, TRANSFER_ENCODING,
};
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::error::ErrorKind;
use crate::request::{RequestBody, RequestDescriptor};
use crate::util::redact_url_for_logs;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedirectPolicy {
    enabled: bool,
    max_redirects: usize,
}

impl RedirectPolicy {
    /// 3xx responses are handed back to the caller as-is.
    pub const fn none() -> Self {
        Self {
            enabled: false,
            max_redirects: 0,
        }
    }

    pub const fn limited(max_redirects: usize) -> Self {
        Self {
            enabled: true,
            max_redirects,
        }
    }

    pub const fn follow() -> Self {
        Self::limited(10)
    }

    pub const fn enabled(self) -> bool {
        self.enabled
    }

    pub const fn max_redirects(self) -> usize {
        if self.enabled { self.max_redirects } else { 0 }
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::limited(5)
    }
}

pub(crate) fn is_redirect_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 305 | 307 | 308)
}

/// Method for the next hop and whether the body goes with it.
pub(crate) fn redirect_method(method: &Method, status: StatusCode) -> (Method, bool) {
    match status.as_u16() {
        303 if *method == Method::HEAD => (Method::HEAD, false),
        303 => (Method::GET, false),
        301 | 302 if *method != Method::GET && *method != Method::HEAD => (Method::GET, false),
        _ => (method.clone(), true),
    }
}

/// Scheme, host and effective port all match.
pub(crate) fn same_origin(left: &Url, right: &Url) -> bool {
    left.origin() == right.origin()
}

/// Absolute locations replace the target, `//host/path` keeps the scheme and
/// relative paths resolve against the current one with dot segments removed.
pub(crate) fn resolve_location(current: &Url, location: &str) -> Option<Url> {
    let resolved = current.join(location.trim()).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") || resolved.host_str().is_none() {
        return None;
    }
    Some(resolved)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RedirectStep {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) keep_body: bool,
    pub(crate) cross_origin: bool,
}

/// Decides what a response means for the redirect loop. `Ok(None)` ends the
/// loop with this response; `followed` is the number of hops already taken.
pub(crate) fn evaluate(
    policy: RedirectPolicy,
    status: StatusCode,
    headers: &HeaderMap,
    method: &Method,
    current: &Url,
    followed: usize,
) -> Result<Option<RedirectStep>, ErrorKind> {
    if !policy.enabled() || !is_redirect_status(status) {
        return Ok(None);
    }
    if followed >= policy.max_redirects() {
        return Err(ErrorKind::RedirectLimitExceeded {
            followed,
            method: method.clone(),
            url: redact_url_for_logs(current),
        });
    }
    let Some(location) = headers.get(LOCATION) else {
        return Err(ErrorKind::MissingRedirectLocation {
            status: status.as_u16(),
            method: method.clone(),
            url: redact_url_for_logs(current),
        });
    };
    let location_text = String::from_utf8_lossy(location.as_bytes()).into_owned();
    let url = location
        .to_str()
        .ok()
        .and_then(|location| resolve_location(current, location))
        .ok_or_else(|| ErrorKind::InvalidRedirectLocation {
            location: location_text,
            method: method.clone(),
            url: redact_url_for_logs(current),
        })?;

    let (method, keep_body) = redirect_method(method, status);
    let cross_origin = !same_origin(current, &url);
    Ok(Some(RedirectStep {
        method,
        url,
        keep_body,
        cross_origin,
    }))
}

/// Rewrites `descriptor` into the request for the next hop. Query pairs the
/// caller added are dropped; only the query inside the location survives.
pub(crate) fn apply(descriptor: &mut RequestDescriptor, step: &RedirectStep) {
    descriptor.method = step.method.clone();
    descriptor.url = step.url.clone();
    descriptor.query.clear();

    let headers = &mut descriptor.headers;
    headers.remove(CONTENT_LENGTH.as_str());
    headers.remove(TRANSFER_ENCODING.as_str());
    headers.remove(HOST.as_str());
    if !step.keep_body {
        descriptor.body = RequestBody::Empty;
        headers.remove(CONTENT_TYPE.as_str());
    }
    if step.cross_origin {
        headers.remove(AUTHORIZATION.as_str());
        headers.remove(COOKIE.as_str());
    }
}

#[cfg(test)]
mod tests {
    use http::header::LOCATION;
    use http::{HeaderMap, HeaderValue, Method, StatusCode};
    use url::Url;

    use super::{RedirectPolicy, evaluate, redirect_method, resolve_location, same_origin};
    use crate::error::ErrorKind;

    fn url(text: &str) -> Url {
        Url::parse(text).expect("test url should parse")
    }

    fn location(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn see_other_downgrades_every_method_but_head() {
        for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE, Method::GET] {
            assert_eq!(
                redirect_method(&method, StatusCode::SEE_OTHER),
                (Method::GET, false)
            );
        }
        assert_eq!(
            redirect_method(&Method::HEAD, StatusCode::SEE_OTHER),
            (Method::HEAD, false)
        );
    }

    #[test]
    fn moved_and_found_downgrade_unsafe_methods_only() {
        assert_eq!(
            redirect_method(&Method::POST, StatusCode::MOVED_PERMANENTLY),
            (Method::GET, false)
        );
        assert_eq!(
            redirect_method(&Method::DELETE, StatusCode::FOUND),
            (Method::GET, false)
        );
        assert_eq!(
            redirect_method(&Method::HEAD, StatusCode::FOUND),
            (Method::HEAD, true)
        );
    }

    #[test]
    fn temporary_and_permanent_redirects_preserve_method_and_body() {
        for status in [StatusCode::TEMPORARY_REDIRECT, StatusCode::PERMANENT_REDIRECT] {
            assert_eq!(redirect_method(&Method::PUT, status), (Method::PUT, true));
        }
    }

    #[test]
    fn location_resolution_covers_absolute_protocol_relative_and_dot_segments() {
        let current = url("https://api.test/a/b/c?x=1");
        assert_eq!(
            resolve_location(&current, "http://other.test/z")
                .expect("absolute")
                .as_str(),
            "http://other.test/z"
        );
        assert_eq!(
            resolve_location(&current, "//cdn.test/asset")
                .expect("protocol relative")
                .as_str(),
            "https://cdn.test/asset"
        );
        assert_eq!(
            resolve_location(&current, "../d/./e")
                .expect("relative")
                .as_str(),
            "https://api.test/a/d/e"
        );
        assert!(resolve_location(&current, "mailto:someone@api.test").is_none());
    }

    #[test]
    fn origin_compares_effective_ports() {
        assert!(same_origin(&url("https://a.test/"), &url("https://a.test:443/x")));
        assert!(!same_origin(&url("http://a.test/"), &url("https://a.test/")));
        assert!(!same_origin(&url("http://a.test/"), &url("http://b.test/")));
    }

    #[test]
    fn limit_is_checked_before_location() {
        let error = evaluate(
            RedirectPolicy::limited(2),
            StatusCode::FOUND,
            &HeaderMap::new(),
            &Method::GET,
            &url("http://a.test/"),
            2,
        )
        .expect_err("third redirect exceeds the limit");
        assert!(matches!(
            error,
            ErrorKind::RedirectLimitExceeded { followed: 2, .. }
        ));
    }

    #[test]
    fn missing_location_is_distinct_from_limit() {
        let error = evaluate(
            RedirectPolicy::default(),
            StatusCode::FOUND,
            &HeaderMap::new(),
            &Method::GET,
            &url("http://a.test/"),
            0,
        )
        .expect_err("location is required");
        assert!(matches!(
            error,
            ErrorKind::MissingRedirectLocation { status: 302, .. }
        ));
    }

    #[test]
    fn disabled_policy_and_non_redirects_stop_the_loop() {
        let headers = location("/next");
        let current = url("http://a.test/");
        assert_eq!(
            evaluate(
                RedirectPolicy::none(),
                StatusCode::FOUND,
                &headers,
                &Method::GET,
                &current,
                0
            )
            .expect("no error"),
            None
        );
        assert_eq!(
            evaluate(
                RedirectPolicy::default(),
                StatusCode::NOT_MODIFIED,
                &headers,
                &Method::GET,
                &current,
                0
            )
            .expect("no error"),
            None
        );
    }

    #[test]
    fn cross_origin_step_is_flagged() {
        let step = evaluate(
            RedirectPolicy::default(),
            StatusCode::MOVED_PERMANENTLY,
            &location("http://b.test/landing"),
            &Method::GET,
            &url("http://a.test/start"),
            0,
        )
        .expect("redirect is valid")
        .expect("redirect is followed");
        assert!(step.cross_origin);
        assert_eq!(step.method, Method::GET);
        assert_eq!(step.url.as_str(), "http://b.test/landing");
    }
}
