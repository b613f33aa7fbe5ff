//! Protocol-neutral request description
//!
//! Actions return a [`Request`]; every protocol client consumes the same
//! shape and interprets the fields it understands.

use bytes::Bytes;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::address::Url;
use crate::error::Result;

/// Default number of redirects a request follows
pub const DEFAULT_REDIRECTS: u32 = 3;

/// Header map preserving insertion order and the caller's name casing.
///
/// Lookups are case-insensitive. Inserting an existing name replaces its
/// value in place; appending joins values with `", "`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    entries: IndexMap<String, (String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let key = name.to_ascii_lowercase();
        let value = value.into();
        match self.entries.get_mut(&key) {
            Some(slot) => slot.1 = value,
            None => {
                self.entries.insert(key, (name, value));
            }
        }
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let key = name.to_ascii_lowercase();
        let value = value.into();
        match self.entries.get_mut(&key) {
            Some(slot) => {
                slot.1.push_str(", ");
                slot.1.push_str(&value);
            }
            None => {
                self.entries.insert(key, (name, value));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries
            .shift_remove(&name.to_ascii_lowercase())
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate as (original name, value) in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.append(k, v);
        }
        headers
    }
}

/// Request payload
#[derive(Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    /// Built lazily, once per send (and again on redirect/retry)
    Deferred(Arc<dyn Fn() -> Bytes + Send + Sync>),
}

impl Body {
    pub fn materialize(&self) -> Bytes {
        match self {
            Self::Empty => Bytes::new(),
            Self::Bytes(b) => b.clone(),
            Self::Deferred(build) => build(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::Bytes(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

/// A ready-to-issue operation
#[derive(Clone, Debug)]
pub struct Request {
    pub method: String,
    pub url: Arc<Url>,
    pub headers: Headers,
    pub body: Body,
    /// Total deadline for the operation, redirects included
    pub timeout: Option<Duration>,
    /// Remaining redirects this request may follow
    pub redirects: u32,
    /// Whether a reply is awaited (UDP, WebSocket)
    pub expect_reply: bool,
}

impl Request {
    pub fn new(method: &str, url: &str) -> Result<Self> {
        Ok(Self {
            method: method.to_ascii_uppercase(),
            url: Arc::new(Url::parse(url)?),
            headers: Headers::new(),
            body: Body::Empty,
            timeout: None,
            redirects: DEFAULT_REDIRECTS,
            expect_reply: true,
        })
    }

    pub fn get(url: &str) -> Result<Self> {
        Self::new("GET", url)
    }

    pub fn post(url: &str, body: impl Into<Body>) -> Result<Self> {
        Ok(Self::new("POST", url)?.body(body))
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn deferred_body(mut self, build: impl Fn() -> Bytes + Send + Sync + 'static) -> Self {
        self.body = Body::Deferred(Arc::new(build));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn redirects(mut self, redirects: u32) -> Self {
        self.redirects = redirects;
        self
    }

    pub fn no_reply(mut self) -> Self {
        self.expect_reply = false;
        self
    }
}
