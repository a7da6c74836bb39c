use std::error::Error as StdError;
use std::io;
use std::sync::Mutex;

use http::header::{HeaderName, HeaderValue};
use url::Url;

use crate::error::{Error, ErrorKind, TransportErrorKind};

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn redact_url_for_logs(url: &Url) -> String {
    let mut redacted = url.clone();
    let _ = redacted.set_username("");
    let _ = redacted.set_password(None);
    redacted.set_query(None);
    redacted.set_fragment(None);
    redacted.to_string()
}

pub(crate) fn join_base_path(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let relative = path.trim_start_matches('/');
    match (base.is_empty(), relative.is_empty()) {
        (true, true) => String::new(),
        (true, false) => relative.to_owned(),
        (false, true) => base.to_owned(),
        (false, false) => format!("{base}/{relative}"),
    }
}

/// Absolute http(s) targets are used as-is; anything else is joined onto the
/// configured base url.
pub(crate) fn resolve_url(base_url: Option<&str>, target: &str) -> Result<Url, Error> {
    let invalid = || {
        Error::from(ErrorKind::InvalidUrl {
            url: target.to_owned(),
        })
    };
    let url = match Url::parse(target) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let Some(base_url) = base_url else {
                return Err(invalid());
            };
            Url::parse(&join_base_path(base_url, target)).map_err(|_| invalid())?
        }
        Err(_) => return Err(invalid()),
    };
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid());
    }
    Ok(url)
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse().map_err(|source| {
        Error::from(ErrorKind::InvalidHeaderName {
            name: name.to_owned(),
            source,
        })
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value.parse().map_err(|source| {
        Error::from(ErrorKind::InvalidHeaderValue {
            name: name.to_owned(),
            source,
        })
    })
}

/// Walks the source chain for an `io::Error` first, then falls back to the
/// rendered messages the connector stacks produce.
pub(crate) fn classify_transport_error(error: &(dyn StdError + 'static)) -> TransportErrorKind {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(item) = current {
        if let Some(io_error) = item.downcast_ref::<io::Error>() {
            match io_error.kind() {
                io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut => {
                    return TransportErrorKind::Connect;
                }
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe => return TransportErrorKind::Reset,
                _ => {}
            }
        }
        current = item.source();
    }

    let text = render_chain(error).to_ascii_lowercase();
    if text.contains("dns")
        || text.contains("name or service not known")
        || text.contains("failed to lookup address")
        || text.contains("no such host")
    {
        return TransportErrorKind::Dns;
    }
    if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
        return TransportErrorKind::Tls;
    }
    if text.contains("connection reset") || text.contains("broken pipe") {
        return TransportErrorKind::Reset;
    }
    if text.contains("connection refused") || text.contains("connect") {
        return TransportErrorKind::Connect;
    }
    if text.contains("unexpected eof") || text.contains("incomplete") || text.contains("read") {
        return TransportErrorKind::Read;
    }
    TransportErrorKind::Other
}

fn render_chain(error: &(dyn StdError + 'static)) -> String {
    let mut text = error.to_string();
    let mut current = error.source();
    while let Some(item) = current {
        text.push_str(": ");
        text.push_str(&item.to_string());
        current = item.source();
    }
    text
}
