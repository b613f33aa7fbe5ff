//! Target addresses
//!
//! A [`Url`] is parsed once from its string form and then shared. The DNS
//! cache enriches it into a [`ResolvedUrl`] on first use; both are immutable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{Result, SurgeError};

/// Pool key: the (scheme, host, port) triple connections are reused under
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Origin {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Origin {
    pub fn is_tls(&self) -> bool {
        is_tls_scheme(&self.scheme)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Parsed target address
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Url {
    raw: String,
    origin: Origin,
    path: String,
    query: Option<String>,
}

impl Url {
    /// Parse an absolute URL
    pub fn parse(input: &str) -> Result<Self> {
        let parsed = ::url::Url::parse(input).map_err(|e| SurgeError::InvalidUrl {
            url: input.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_parsed(parsed)
    }

    fn from_parsed(parsed: ::url::Url) -> Result<Self> {
        let invalid = |reason: &str| SurgeError::InvalidUrl {
            url: parsed.as_str().to_string(),
            reason: reason.to_string(),
        };
        let scheme = parsed.scheme().to_ascii_lowercase();
        let host = parsed
            .host_str()
            .ok_or_else(|| invalid("missing host"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = parsed
            .port()
            .or_else(|| default_port(&scheme))
            .ok_or_else(|| invalid("missing port"))?;
        let path = match parsed.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };
        Ok(Self {
            raw: parsed.as_str().to_string(),
            origin: Origin { scheme, host, port },
            path,
            query: parsed.query().map(str::to_string),
        })
    }

    /// Resolve a `Location` value against this URL
    pub fn join(&self, location: &str) -> Result<Self> {
        let base = ::url::Url::parse(&self.raw).map_err(|e| SurgeError::InvalidUrl {
            url: self.raw.clone(),
            reason: e.to_string(),
        })?;
        let next = base.join(location).map_err(|e| SurgeError::InvalidUrl {
            url: location.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_parsed(next)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn scheme(&self) -> &str {
        &self.origin.scheme
    }

    pub fn host(&self) -> &str {
        &self.origin.host
    }

    pub fn port(&self) -> u16 {
        self.origin.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn is_tls(&self) -> bool {
        self.origin.is_tls()
    }

    /// Request target for the request line / `:path` pseudo-header
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    /// Value for `Host` / `:authority`, omitting the scheme's default port
    pub fn authority(&self) -> String {
        let host = if self.origin.host.contains(':') {
            format!("[{}]", self.origin.host)
        } else {
            self.origin.host.clone()
        };
        if default_port(&self.origin.scheme) == Some(self.origin.port) {
            host
        } else {
            format!("{}:{}", host, self.origin.port)
        }
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Socket family of a resolved address set
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrFamily {
    V4,
    V6,
}

/// A URL enriched with resolved socket addresses
#[derive(Clone, Debug)]
pub struct ResolvedUrl {
    pub url: Arc<Url>,
    pub addrs: Arc<[SocketAddr]>,
    pub family: AddrFamily,
}

impl ResolvedUrl {
    pub fn new(url: Arc<Url>, addrs: Arc<[SocketAddr]>) -> Self {
        let family = match addrs.first() {
            Some(SocketAddr::V6(_)) => AddrFamily::V6,
            _ => AddrFamily::V4,
        };
        Self { url, addrs, family }
    }

    pub fn is_tls(&self) -> bool {
        self.url.is_tls()
    }
}

fn is_tls_scheme(scheme: &str) -> bool {
    matches!(scheme, "https" | "wss" | "grpcs")
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" | "grpc" => Some(80),
        "https" | "wss" | "grpcs" => Some(443),
        _ => None,
    }
}
