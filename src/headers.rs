//! Header bag and query accumulation for outgoing requests.

use std::collections::HashMap;

use http::HeaderMap;
use http::header::{HeaderName, HeaderValue};
use serde::Serialize;
use url::Url;
use url::form_urlencoded;

use crate::Result;
use crate::error::{Error, ErrorKind};
use crate::util::{parse_header_name, parse_header_value};

/// Case-insensitive header storage that remembers how each name was spelled
/// the first time it was written.
#[derive(Clone, Debug, Default)]
pub struct HeaderBag {
    map: HeaderMap,
    spellings: HashMap<HeaderName, String>,
}

impl HeaderBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any existing values for `name`.
    pub fn insert(&mut self, name: &str, value: &str) -> Result<()> {
        let header_name = parse_header_name(name)?;
        let header_value = parse_header_value(name, value)?;
        self.remember_spelling(&header_name, name);
        self.map.insert(header_name, header_value);
        Ok(())
    }

    pub fn append(&mut self, name: &str, value: &str) -> Result<()> {
        let header_name = parse_header_name(name)?;
        let header_value = parse_header_value(name, value)?;
        self.remember_spelling(&header_name, name);
        self.map.append(header_name, header_value);
        Ok(())
    }

    pub fn insert_typed(&mut self, name: HeaderName, value: HeaderValue) {
        let spelling = name.as_str().to_owned();
        self.remember_spelling(&name, &spelling);
        self.map.insert(name, value);
    }

    /// Inserts only when no value is present yet.
    pub fn insert_default(&mut self, name: HeaderName, value: HeaderValue) {
        if !self.map.contains_key(&name) {
            self.insert_typed(name, value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.map
            .get_all(name)
            .into_iter()
            .filter_map(|value| value.to_str().ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<HeaderValue> {
        let header_name = HeaderName::from_bytes(name.as_bytes()).ok()?;
        self.spellings.remove(&header_name);
        self.map.remove(&header_name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Yields each header with the spelling used on its first write.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.map.iter().map(|(name, value)| {
            let spelling = self
                .spellings
                .get(name)
                .map(String::as_str)
                .unwrap_or(name.as_str());
            (spelling, value)
        })
    }

    pub fn as_map(&self) -> &HeaderMap {
        &self.map
    }

    /// Copies every header from `defaults` whose name is not set here.
    pub fn merge_defaults(&mut self, defaults: &HeaderBag) {
        for name in defaults.map.keys() {
            if self.map.contains_key(name) {
                continue;
            }
            for value in defaults.map.get_all(name) {
                self.map.append(name.clone(), value.clone());
            }
            if let Some(spelling) = defaults.spellings.get(name) {
                self.spellings.insert(name.clone(), spelling.clone());
            }
        }
    }

    fn remember_spelling(&mut self, name: &HeaderName, spelling: &str) {
        if !self.map.contains_key(name) {
            self.spellings.insert(name.clone(), spelling.to_owned());
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum QueryEntry {
    Pair(String, String),
    Raw(String),
}

/// Ordered query multimap. Structured pairs are form-encoded when rendered;
/// raw fragments are appended exactly as supplied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryParams {
    entries: Vec<QueryEntry>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries
            .push(QueryEntry::Pair(name.into(), value.into()));
    }

    pub fn extend_pairs<K, V, I>(&mut self, pairs: I)
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (name, value) in pairs {
            self.push(name, value);
        }
    }

    pub fn push_serialized<T>(&mut self, params: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_urlencoded::to_string(params).map_err(|source| {
            Error::from(ErrorKind::Serialize {
                content_type: "application/x-www-form-urlencoded".to_owned(),
                source: Box::new(source),
            })
        })?;
        self.extend_pairs(form_urlencoded::parse(encoded.as_bytes()));
        Ok(())
    }

    pub fn push_raw(&mut self, raw: impl Into<String>) {
        let raw = raw.into();
        let raw = raw.trim_start_matches('?');
        if !raw.is_empty() {
            self.entries.push(QueryEntry::Raw(raw.to_owned()));
        }
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|entry| match entry {
            QueryEntry::Pair(name, value) => Some((name.as_str(), value.as_str())),
            QueryEntry::Raw(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn render(&self) -> String {
        let mut rendered = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            match entry {
                QueryEntry::Pair(name, value) => {
                    let mut serializer = form_urlencoded::Serializer::new(String::new());
                    serializer.append_pair(name, value);
                    rendered.push(serializer.finish());
                }
                QueryEntry::Raw(raw) => rendered.push(raw.clone()),
            }
        }
        rendered.join("&")
    }

    /// Appends the rendered entries after whatever query `url` already has.
    pub fn apply_to(&self, url: &Url) -> Url {
        let rendered = self.render();
        if rendered.is_empty() {
            return url.clone();
        }
        let query = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{existing}&{rendered}"),
            _ => rendered,
        };
        let mut merged = url.clone();
        merged.set_query(Some(&query));
        merged
    }
}
