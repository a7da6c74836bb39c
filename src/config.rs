use std::sync::Arc;
use std::time::Duration;

use crate::codec::CodecRegistry;
use crate::cookie::CookieJar;
use crate::headers::HeaderBag;
use crate::middleware::Pipeline;
use crate::redirect::RedirectPolicy;
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutSettings;

/// What a final non-2xx/3xx response means for the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StatusPolicy {
    /// 4xx and 5xx become [`ErrorKind::Status`](crate::ErrorKind::Status),
    /// which still carries the response.
    #[default]
    Error,
    /// Every final response is returned as a success.
    Response,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientProfile {
    #[default]
    Standard,
    LowLatency,
    Resilient,
}

#[derive(Clone, Debug)]
pub struct ProfileDefaults {
    pub timeouts: TimeoutSettings,
    pub retry_policy: RetryPolicy,
    pub redirect_policy: RedirectPolicy,
    pub status_policy: StatusPolicy,
}

impl ClientProfile {
    pub fn defaults(self) -> ProfileDefaults {
        match self {
            Self::Standard => ProfileDefaults {
                timeouts: TimeoutSettings::new()
                    .connect(Duration::from_secs(10))
                    .response(Duration::from_secs(30)),
                retry_policy: RetryPolicy::disabled(),
                redirect_policy: RedirectPolicy::default(),
                status_policy: StatusPolicy::Error,
            },
            Self::LowLatency => ProfileDefaults {
                timeouts: TimeoutSettings::new()
                    .connect(Duration::from_secs(1))
                    .response(Duration::from_secs(2))
                    .deadline(Duration::from_secs(5)),
                retry_policy: RetryPolicy::standard()
                    .max_retries(1)
                    .base_backoff(Duration::from_millis(50))
                    .max_backoff(Duration::from_millis(300)),
                redirect_policy: RedirectPolicy::limited(3),
                status_policy: StatusPolicy::Error,
            },
            Self::Resilient => ProfileDefaults {
                timeouts: TimeoutSettings::new()
                    .connect(Duration::from_secs(5))
                    .response(Duration::from_secs(20))
                    .deadline(Duration::from_secs(60)),
                retry_policy: RetryPolicy::standard()
                    .max_retries(3)
                    .base_backoff(Duration::from_millis(200))
                    .max_backoff(Duration::from_secs(3)),
                redirect_policy: RedirectPolicy::follow(),
                status_policy: StatusPolicy::Error,
            },
        }
    }
}

/// Everything a client applies to the requests it issues. Built once by
/// [`ClientBuilder`](crate::ClientBuilder) and shared read-only afterwards;
/// per-request settings override it field by field.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub(crate) base_url: Option<String>,
    pub(crate) default_headers: HeaderBag,
    pub(crate) timeouts: TimeoutSettings,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) redirect_policy: RedirectPolicy,
    pub(crate) status_policy: StatusPolicy,
    pub(crate) codecs: CodecRegistry,
    pub(crate) middleware: Pipeline,
    pub(crate) cookie_jar: Option<Arc<CookieJar>>,
    pub(crate) decompress: bool,
}

impl ClientConfig {
    pub fn from_profile(profile: ClientProfile) -> Self {
        let defaults = profile.defaults();
        Self {
            base_url: None,
            default_headers: HeaderBag::new(),
            timeouts: defaults.timeouts,
            retry_policy: defaults.retry_policy,
            redirect_policy: defaults.redirect_policy,
            status_policy: defaults.status_policy,
            codecs: CodecRegistry::standard(),
            middleware: Pipeline::new(),
            cookie_jar: None,
            decompress: true,
        }
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    pub fn default_headers(&self) -> &HeaderBag {
        &self.default_headers
    }

    pub fn timeouts(&self) -> TimeoutSettings {
        self.timeouts
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn redirect_policy(&self) -> RedirectPolicy {
        self.redirect_policy
    }

    pub fn status_policy(&self) -> StatusPolicy {
        self.status_policy
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn middleware(&self) -> &Pipeline {
        &self.middleware
    }

    pub fn cookie_jar(&self) -> Option<&Arc<CookieJar>> {
        self.cookie_jar.as_ref()
    }

    pub fn decompress(&self) -> bool {
        self.decompress
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_profile(ClientProfile::Standard)
    }
}
