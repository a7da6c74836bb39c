//! `reqflow` drives HTTP requests through a full client lifecycle: middleware,
//! redirects, retries, timeouts, cookies, body codecs and response
//! decompression, on top of a pluggable [`Transport`](transport::Transport).
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use reqflow::prelude::{Client, ClientProfile, Readable, StatusInfo};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct CreatedItem {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .profile(ClientProfile::Resilient)
//!         .base_url("https://api.example.com/v1")
//!         .deadline(Duration::from_secs(8))
//!         .cookie_store(true)
//!         .try_build()?;
//!
//!     let response = client
//!         .post("/items")
//!         .json(&serde_json::json!({ "name": "demo" }))?
//!         .await?;
//!     let created: CreatedItem = response.json()?;
//!     println!("{} created id={} ({} bytes)", response.status(), created.id, response.payload().len());
//!     Ok(())
//! }
//! ```
//!
//! # Lifecycle
//!
//! Each call arms its deadline once, then for every attempt runs the
//! middleware request phase, attaches jar cookies, prepares the body, connects
//! under the connect timer and waits for the response head under the response
//! timer. Redirects loop back to the middleware phase; the final response is
//! decompressed, read, handed to the middleware response phase in reverse
//! order, checked against the status policy and parsed. Retryable failures
//! restart the whole lifecycle from the original request.

mod client;
pub mod codec;
mod config;
pub mod cookie;
mod decompress;
mod engine;
mod error;
mod headers;
pub mod middleware;
pub mod multipart;
mod redirect;
mod request;
mod response;
mod retry;
mod timeout;
pub mod transport;
mod util;

pub use crate::client::{Client, ClientBuilder};
pub use crate::codec::{BodyParser, BodySerializer, CodecRegistry, ParsedBody};
pub use crate::config::{ClientConfig, ClientProfile, ProfileDefaults, StatusPolicy};
pub use crate::cookie::{CookieJar, CookieRecord, Expiry};
pub use crate::decompress::ContentCoding;
pub use crate::engine::{AbortHandle, Call};
pub use crate::error::{
    AttachmentErrorKind, BoxError, Error, ErrorCode, ErrorKind, LifecycleMetadata,
    TransportErrorKind,
};
pub use crate::headers::{HeaderBag, QueryParams};
pub use crate::middleware::{AttemptRequest, Middleware, Pipeline, RequestContext};
pub use crate::multipart::MultipartForm;
pub use crate::redirect::RedirectPolicy;
pub use crate::request::{RequestBody, RequestBuilder, RequestDescriptor};
pub use crate::response::{HeaderAccess, Readable, ResponseEnvelope, StatusInfo};
pub use crate::retry::{RetryClassifier, RetryDecision, RetryPolicy};
pub use crate::timeout::{TimeoutKind, TimeoutSettings};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Call, Client, ClientBuilder, ClientProfile, CookieJar, Error, ErrorCode, ErrorKind,
        HeaderAccess, Middleware, MultipartForm, Readable, RedirectPolicy, RequestContext,
        ResponseEnvelope, Result, RetryPolicy, StatusInfo, StatusPolicy, TimeoutKind,
        TimeoutSettings,
    };
}

#[cfg(test)]
mod test_support {
    use std::io;
    use std::sync::Arc;

    use futures_util::future::BoxFuture;
    use url::Url;

    use crate::error::TransportErrorKind;
    use crate::transport::{Connection, Transport, TransportError};

    struct Unreachable;

    impl Transport for Unreachable {
        fn connect<'a>(
            &'a self,
            _url: &'a Url,
        ) -> BoxFuture<'a, Result<Box<dyn Connection>, TransportError>> {
            Box::pin(async {
                Err(TransportError::new(
                    TransportErrorKind::Connect,
                    io::Error::from(io::ErrorKind::ConnectionRefused),
                ))
            })
        }
    }

    /// Refuses every connection.
    pub(crate) fn unreachable_transport() -> Arc<dyn Transport> {
        Arc::new(Unreachable)
    }
}
