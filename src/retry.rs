use std::sync::Arc;
use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;
use http::{HeaderMap, Method, StatusCode};
use rand::Rng;

use crate::error::{Error, ErrorCode, ErrorKind, TransportErrorKind};
use crate::timeout::TimeoutKind;

/// One failed attempt, as seen by a [`RetryClassifier`].
#[derive(Clone, Debug)]
pub struct RetryDecision {
    /// 1-based number of the attempt that just failed.
    pub attempt: usize,
    pub max_retries: usize,
    pub method: Method,
    pub url: String,
    pub code: Option<ErrorCode>,
    pub status: Option<StatusCode>,
    pub transport_error_kind: Option<TransportErrorKind>,
    pub timeout_kind: Option<TimeoutKind>,
}

impl RetryDecision {
    pub(crate) fn from_error(
        error: &Error,
        attempt: usize,
        max_retries: usize,
        method: &Method,
        url: String,
    ) -> Self {
        Self {
            attempt,
            max_retries,
            method: method.clone(),
            url,
            code: Some(error.code()),
            status: error.status(),
            transport_error_kind: error.transport_kind(),
            timeout_kind: error.timeout_kind(),
        }
    }

    /// A response that is not an error for the caller but may still be worth
    /// another attempt (5xx under the pass-through status policy).
    pub(crate) fn from_status(
        status: StatusCode,
        attempt: usize,
        max_retries: usize,
        method: &Method,
        url: String,
    ) -> Self {
        Self {
            attempt,
            max_retries,
            method: method.clone(),
            url,
            code: None,
            status: Some(status),
            transport_error_kind: None,
            timeout_kind: None,
        }
    }
}

pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, decision: &RetryDecision) -> bool;
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    base_backoff: Duration,
    max_backoff: Duration,
    jitter_ratio: f64,
    retry_on_middleware_error: bool,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_backoff", &self.base_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("jitter_ratio", &self.jitter_ratio)
            .field("retry_on_middleware_error", &self.retry_on_middleware_error)
            .field("retry_classifier", &self.retry_classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// No retries, no backoff.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter_ratio: 0.0,
            retry_on_middleware_error: false,
            retry_classifier: None,
        }
    }

    /// Two retries with jittered exponential backoff from 100ms up to 2s.
    pub fn standard() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            jitter_ratio: 0.2,
            retry_on_middleware_error: false,
            retry_classifier: None,
        }
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before the first retry; each later retry doubles it up to
    /// `max_backoff`.
    pub fn base_backoff(mut self, base_backoff: Duration) -> Self {
        self.base_backoff = base_backoff;
        if self.max_backoff < self.base_backoff {
            self.max_backoff = self.base_backoff;
        }
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_backoff);
        self
    }

    pub fn jitter_ratio(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn retry_on_middleware_error(mut self, retry: bool) -> Self {
        self.retry_on_middleware_error = retry;
        self
    }

    pub fn retry_classifier(mut self, retry_classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(retry_classifier);
        self
    }

    pub fn configured_max_retries(&self) -> usize {
        self.max_retries
    }

    pub(crate) fn should_retry_decision(&self, decision: &RetryDecision) -> bool {
        if let Some(retry_classifier) = &self.retry_classifier {
            return retry_classifier.should_retry(decision);
        }
        if let Some(status) = decision.status {
            return status.is_server_error()
                && matches!(decision.code, None | Some(ErrorCode::HttpStatus));
        }
        if let Some(kind) = decision.transport_error_kind {
            return kind.is_connection_level();
        }
        if decision.timeout_kind.is_some() {
            return true;
        }
        decision.code == Some(ErrorCode::Middleware) && self.retry_on_middleware_error
    }

    pub(crate) fn backoff_for_retry(&self, retry_index: usize) -> Duration {
        if self.base_backoff.is_zero() {
            return Duration::ZERO;
        }
        let capped_exponent = retry_index.saturating_sub(1).min(31) as u32;
        let multiplier = 1_u128 << capped_exponent;
        let base_ms = self.base_backoff.as_millis().max(1);
        let max_ms = self.max_backoff.as_millis().max(base_ms);
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        self.apply_jitter(Duration::from_millis(delay_ms))
    }

    /// Caps a server-requested delay at `max_backoff`. Used when no call
    /// deadline bounds the wait.
    pub(crate) fn cap_server_delay(&self, requested: Duration) -> Duration {
        requested.min(self.max_backoff)
    }

    fn apply_jitter(&self, backoff: Duration) -> Duration {
        if self.jitter_ratio <= f64::EPSILON {
            return backoff;
        }
        let backoff_ms = backoff.as_millis().min(u64::MAX as u128) as u64;
        if backoff_ms <= 1 {
            return backoff;
        }
        let max_backoff_ms = self.max_backoff.as_millis().min(u64::MAX as u128) as u64;
        let jitter_span = ((backoff_ms as f64) * self.jitter_ratio).round().max(1.0) as u64;
        let low = backoff_ms.saturating_sub(jitter_span);
        let high = backoff_ms.saturating_add(jitter_span).max(low);
        let sampled_ms = rand::rng()
            .random_range(low..=high)
            .min(max_backoff_ms.max(1));
        Duration::from_millis(sampled_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Delay requested by a `Retry-After` header, either delta-seconds or an
/// HTTP date. Dates in the past mean "now".
pub(crate) fn retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let raw_value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = raw_value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = httpdate::parse_http_date(raw_value).ok()?;
    Some(date.duration_since(now).unwrap_or(Duration::ZERO))
}

impl Error {
    /// Whether the default classification would retry this error. Middleware
    /// errors report `false` here because retrying them is opt-in.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::Transport { kind, .. } => kind.is_connection_level(),
            ErrorKind::Timeout { .. } => true,
            ErrorKind::Status { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use http::header::RETRY_AFTER;
    use http::{HeaderMap, HeaderValue, Method, StatusCode};

    use super::{RetryClassifier, RetryDecision, RetryPolicy, retry_after};
    use crate::error::{ErrorCode, TransportErrorKind};
    use crate::timeout::TimeoutKind;

    fn decision() -> RetryDecision {
        RetryDecision {
            attempt: 1,
            max_retries: 3,
            method: Method::GET,
            url: "http://api.test/items".to_owned(),
            code: None,
            status: None,
            transport_error_kind: None,
            timeout_kind: None,
        }
    }

    #[test]
    fn server_delay_is_capped_at_max_backoff() {
        let policy = RetryPolicy::standard().max_backoff(Duration::from_secs(2));
        assert_eq!(
            policy.cap_server_delay(Duration::from_secs(86_400)),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.cap_server_delay(Duration::from_millis(500)),
            Duration::from_millis(500)
        );
        assert_eq!(
            RetryPolicy::disabled().cap_server_delay(Duration::from_secs(30)),
            Duration::ZERO
        );
    }

    #[test]
    fn default_classification_matches_retryable_failures() {
        let policy = RetryPolicy::disabled().max_retries(3);

        let mut refused = decision();
        refused.code = Some(ErrorCode::Transport);
        refused.transport_error_kind = Some(TransportErrorKind::Connect);
        assert!(policy.should_retry_decision(&refused));

        let mut read = refused.clone();
        read.transport_error_kind = Some(TransportErrorKind::Read);
        assert!(!policy.should_retry_decision(&read));

        let mut timed_out = decision();
        timed_out.code = Some(ErrorCode::Timeout);
        timed_out.timeout_kind = Some(TimeoutKind::Deadline);
        assert!(policy.should_retry_decision(&timed_out));

        let unavailable = RetryDecision::from_status(
            StatusCode::SERVICE_UNAVAILABLE,
            1,
            3,
            &Method::GET,
            "http://api.test/".to_owned(),
        );
        assert!(policy.should_retry_decision(&unavailable));

        let mut not_found = decision();
        not_found.code = Some(ErrorCode::HttpStatus);
        not_found.status = Some(StatusCode::NOT_FOUND);
        assert!(!policy.should_retry_decision(&not_found));

        let mut parse = decision();
        parse.code = Some(ErrorCode::Parse);
        parse.status = Some(StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!policy.should_retry_decision(&parse));
    }

    #[test]
    fn middleware_errors_retry_only_when_enabled() {
        let mut failed = decision();
        failed.code = Some(ErrorCode::Middleware);
        assert!(!RetryPolicy::disabled().should_retry_decision(&failed));
        assert!(
            RetryPolicy::disabled()
                .retry_on_middleware_error(true)
                .should_retry_decision(&failed)
        );
    }

    #[test]
    fn classifier_overrides_defaults() {
        struct Never;

        impl RetryClassifier for Never {
            fn should_retry(&self, _decision: &RetryDecision) -> bool {
                false
            }
        }

        let policy = RetryPolicy::standard().retry_classifier(Arc::new(Never));
        let mut timed_out = decision();
        timed_out.timeout_kind = Some(TimeoutKind::Response);
        assert!(!policy.should_retry_decision(&timed_out));
    }

    #[test]
    fn backoff_is_zero_by_default_and_capped_when_configured() {
        assert_eq!(RetryPolicy::disabled().backoff_for_retry(4), Duration::ZERO);

        let policy = RetryPolicy::standard()
            .base_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_millis(120))
            .jitter_ratio(1.0);
        for _ in 0..256 {
            assert!(policy.backoff_for_retry(3) <= Duration::from_millis(120));
        }

        let exact = RetryPolicy::standard()
            .base_backoff(Duration::from_millis(10))
            .max_backoff(Duration::from_secs(1))
            .jitter_ratio(0.0);
        assert_eq!(exact.backoff_for_retry(1), Duration::from_millis(10));
        assert_eq!(exact.backoff_for_retry(3), Duration::from_millis(40));
    }

    #[test]
    fn retry_after_accepts_seconds_and_dates() {
        let now = std::time::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(retry_after(&headers, now), Some(Duration::from_secs(3)));

        let later = httpdate::fmt_http_date(now + Duration::from_secs(10));
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_str(&later).expect("date is a valid header"),
        );
        assert_eq!(retry_after(&headers, now), Some(Duration::from_secs(10)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers, now), None);
    }
}
