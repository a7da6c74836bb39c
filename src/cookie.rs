//! Session cookie storage shared by every request a client issues.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;
use url::Url;

use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expiry {
    Session,
    At(SystemTime),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    /// Lowercase, without a leading dot.
    pub domain: String,
    /// Set when the cookie carried no `Domain` attribute; such cookies only
    /// match the exact host that set them.
    pub host_only: bool,
    pub path: String,
    pub expiry: Expiry,
    pub secure: bool,
    pub http_only: bool,
}

impl CookieRecord {
    /// Parses one `Set-Cookie` value received from `url`. Returns `None` for
    /// malformed values and for cookies whose `Domain` the host may not set.
    pub fn parse(set_cookie: &str, url: &Url, now: SystemTime) -> Option<Self> {
        let host = url.host_str()?.to_ascii_lowercase();
        let mut segments = set_cookie.split(';');
        let (name, value) = segments.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut record = Self {
            name: name.to_owned(),
            value: value.trim().trim_matches('"').to_owned(),
            domain: host.clone(),
            host_only: true,
            path: default_path(url.path()),
            expiry: Expiry::Session,
            secure: false,
            http_only: false,
        };
        let mut max_age = None;
        let mut expires = None;

        for attribute in segments {
            let (key, value) = match attribute.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (attribute.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" => {
                    let domain = value.trim_start_matches('.').to_ascii_lowercase();
                    if domain.is_empty() {
                        continue;
                    }
                    if !domain_matches(&host, &domain) {
                        debug!(cookie = %record.name, %domain, %host, "rejecting cookie for foreign domain");
                        return None;
                    }
                    record.domain = domain;
                    record.host_only = false;
                }
                "path" if value.starts_with('/') => record.path = value.to_owned(),
                "max-age" => max_age = value.parse::<i64>().ok(),
                "expires" => expires = httpdate::parse_http_date(value).ok(),
                "secure" => record.secure = true,
                "httponly" => record.http_only = true,
                _ => {}
            }
        }

        record.expiry = match (max_age, expires) {
            (Some(seconds), _) if seconds <= 0 => Expiry::At(UNIX_EPOCH),
            (Some(seconds), _) => now
                .checked_add(Duration::from_secs(seconds.unsigned_abs()))
                .map_or(Expiry::Session, Expiry::At),
            (None, Some(at)) => Expiry::At(at),
            (None, None) => Expiry::Session,
        };
        Some(record)
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        match self.expiry {
            Expiry::Session => false,
            Expiry::At(at) => at <= now,
        }
    }

    pub fn matches_url(&self, url: &Url, now: SystemTime) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        if self.is_expired(now) {
            return false;
        }
        if self.secure && url.scheme() != "https" {
            return false;
        }
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(&host, &self.domain)
        };
        domain_ok && path_matches(url.path(), &self.path)
    }

    fn key(&self) -> CookieKey {
        (self.name.clone(), self.domain.clone(), self.path.clone())
    }
}

/// `host` equals `domain` or is a subdomain of it.
fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

/// Directory of the request path: `/a/b/c` gives `/a/b`, `/a` gives `/`.
fn default_path(request_path: &str) -> String {
    if !request_path.starts_with('/') {
        return "/".to_owned();
    }
    match request_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(index) => request_path[..index].to_owned(),
    }
}

type CookieKey = (String, String, String);

/// Thread-safe cookie store. One record per (name, domain, path); the most
/// recent write wins and a past expiry deletes.
#[derive(Debug, Default)]
pub struct CookieJar {
    records: Mutex<BTreeMap<CookieKey, CookieRecord>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores every parsable `Set-Cookie` value received from `url` and
    /// returns how many were accepted.
    pub fn set_cookies<'a, I>(&self, values: I, url: &Url) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let now = SystemTime::now();
        let mut accepted = 0;
        let mut records = lock_unpoisoned(&self.records);
        for value in values {
            match CookieRecord::parse(value, url, now) {
                Some(record) => {
                    Self::upsert(&mut records, record, now);
                    accepted += 1;
                }
                None => debug!(url = %url.host_str().unwrap_or_default(), "ignoring unparsable set-cookie value"),
            }
        }
        accepted
    }

    pub fn set_cookie(&self, value: &str, url: &Url) -> bool {
        self.set_cookies([value], url) == 1
    }

    pub fn insert(&self, record: CookieRecord) {
        let now = SystemTime::now();
        let mut records = lock_unpoisoned(&self.records);
        Self::upsert(&mut records, record, now);
    }

    fn upsert(records: &mut BTreeMap<CookieKey, CookieRecord>, record: CookieRecord, now: SystemTime) {
        let key = record.key();
        if record.is_expired(now) {
            records.remove(&key);
        } else {
            records.insert(key, record);
        }
    }

    /// Builds the `Cookie` header value for `url`, or `None` when nothing
    /// matches. When one name is stored under several matching paths, only
    /// the most specific path is sent.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        let now = SystemTime::now();
        let records = lock_unpoisoned(&self.records);
        let mut matching: Vec<&CookieRecord> = records
            .values()
            .filter(|record| record.matches_url(url, now))
            .collect();
        matching.sort_by(|left, right| right.path.len().cmp(&left.path.len()));

        let mut seen = Vec::with_capacity(matching.len());
        let mut pairs = Vec::with_capacity(matching.len());
        for record in matching {
            if seen.contains(&record.name.as_str()) {
                continue;
            }
            seen.push(record.name.as_str());
            pairs.push(format!("{}={}", record.name, record.value));
        }

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    pub fn cookies(&self) -> Vec<CookieRecord> {
        lock_unpoisoned(&self.records).values().cloned().collect()
    }

    pub fn purge_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut records = lock_unpoisoned(&self.records);
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        before - records.len()
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.records).clear();
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_unpoisoned(&self.records).is_empty()
    }
}
