//! # DNS Cache
//!
//! Memoizes host lookups for the lifetime of a worker. Concurrent
//! [`DnsCache::resolve`] calls for the same host share one in-flight lookup
//! (single flight); the answer is cached until its TTL expires or the host
//! is invalidated. Failed lookups are not cached.
//!
//! ```text
//!   resolve(h) ──► Ready & fresh ─────────────► addrs
//!              ├─► Pending(gen) ── await ─────► addrs
//!              └─► absent ── spawn lookup(gen) ► Pending ─► Ready
//! ```

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use surge_core::{ResolvedUrl, SurgeError, Url};

/// Source of address lookups
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

type Lookup = Shared<BoxFuture<'static, Result<Arc<[IpAddr]>, String>>>;

enum Slot {
    Pending { generation: u64, lookup: Lookup },
    Ready { addrs: Arc<[IpAddr]>, expires: Instant },
}

/// Cache statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DnsStats {
    /// Lookups actually issued to the resolver
    pub lookups: u64,
    /// Answers served from a ready entry
    pub hits: u64,
    /// Callers that joined an in-flight lookup
    pub coalesced: u64,
    pub failures: u64,
}

/// Single-flight, TTL-bounded host cache
pub struct DnsCache {
    resolver: Arc<dyn Resolver>,
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot>>,
    generation: AtomicU64,
    stats: RwLock<DnsStats>,
}

impl DnsCache {
    pub fn new(resolver: Arc<dyn Resolver>, ttl: Duration) -> Self {
        Self {
            resolver,
            ttl,
            slots: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            stats: RwLock::new(DnsStats::default()),
        }
    }

    /// Cache using the system resolver
    pub fn system(ttl: Duration) -> Self {
        Self::new(Arc::new(SystemResolver), ttl)
    }

    /// Resolve a URL's host, joining or starting a lookup as needed
    pub async fn resolve(&self, url: &Arc<Url>) -> Result<ResolvedUrl, SurgeError> {
        let host = url.host();
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ResolvedUrl::new(
                url.clone(),
                Arc::from(vec![SocketAddr::new(ip, url.port())]),
            ));
        }

        let (generation, lookup) = {
            let mut slots = self.slots.lock();
            match slots.get(host) {
                Some(Slot::Ready { addrs, expires }) if *expires > Instant::now() => {
                    self.stats.write().hits += 1;
                    return Ok(with_port(url, addrs));
                }
                Some(Slot::Pending { generation, lookup }) => {
                    self.stats.write().coalesced += 1;
                    (*generation, lookup.clone())
                }
                _ => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let resolver = self.resolver.clone();
                    let owned = host.to_string();
                    let lookup: Lookup = async move {
                        match resolver.lookup(&owned).await {
                            Ok(addrs) if addrs.is_empty() => Err("no addresses".to_string()),
                            Ok(addrs) => Ok(Arc::from(addrs)),
                            Err(e) => Err(e.to_string()),
                        }
                    }
                    .boxed()
                    .shared();
                    slots.insert(
                        host.to_string(),
                        Slot::Pending {
                            generation,
                            lookup: lookup.clone(),
                        },
                    );
                    self.stats.write().lookups += 1;
                    debug!(host, "dns lookup started");
                    (generation, lookup)
                }
            }
        };

        let outcome = lookup.await;

        // Only the generation that is still installed may settle the slot;
        // an invalidation in the meantime wins.
        {
            let mut slots = self.slots.lock();
            let current = matches!(
                slots.get(host),
                Some(Slot::Pending { generation: g, .. }) if *g == generation
            );
            if current {
                match &outcome {
                    Ok(addrs) => {
                        slots.insert(
                            host.to_string(),
                            Slot::Ready {
                                addrs: addrs.clone(),
                                expires: Instant::now() + self.ttl,
                            },
                        );
                    }
                    Err(_) => {
                        slots.remove(host);
                        self.stats.write().failures += 1;
                    }
                }
            }
        }

        match outcome {
            Ok(addrs) => Ok(with_port(url, &addrs)),
            Err(reason) => Err(SurgeError::Dns {
                host: host.to_string(),
                reason,
            }),
        }
    }

    /// Forget a host; the next resolve performs a fresh lookup
    pub fn invalidate(&self, host: &str) {
        if self.slots.lock().remove(host).is_some() {
            debug!(host, "dns entry invalidated");
        }
    }

    pub fn stats(&self) -> DnsStats {
        self.stats.read().clone()
    }
}

fn with_port(url: &Arc<Url>, addrs: &Arc<[IpAddr]>) -> ResolvedUrl {
    let sockets: Vec<SocketAddr> = addrs
        .iter()
        .map(|ip| SocketAddr::new(*ip, url.port()))
        .collect();
    ResolvedUrl::new(url.clone(), Arc::from(sockets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingResolver {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Resolver for CountingResolver {
        async fn lookup(&self, _host: &str) -> std::io::Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "nxdomain"));
            }
            Ok(vec!["10.0.0.7".parse().unwrap()])
        }
    }

    fn cache(fail: bool) -> (Arc<DnsCache>, Arc<CountingResolver>) {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
            fail,
        });
        let cache = Arc::new(DnsCache::new(resolver.clone(), Duration::from_secs(60)));
        (cache, resolver)
    }

    async fn burst(cache: &Arc<DnsCache>, url: &Arc<Url>, n: usize) {
        let mut handles = Vec::new();
        for _ in 0..n {
            let cache = cache.clone();
            let url = url.clone();
            handles.push(tokio::spawn(async move { cache.resolve(&url).await }));
        }
        for h in handles {
            let resolved = h.await.unwrap().unwrap();
            assert_eq!(resolved.addrs[0], "10.0.0.7:8080".parse().unwrap());
        }
    }

    #[tokio::test]
    async fn test_single_flight_then_invalidate() {
        let (cache, resolver) = cache(false);
        let url = Arc::new(Url::parse("http://svc.test:8080/").unwrap());

        burst(&cache, &url, 16).await;
        cache.invalidate("svc.test");
        burst(&cache, &url, 16).await;

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().lookups, 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let (cache, resolver) = cache(true);
        let url = Arc::new(Url::parse("http://gone.test/").unwrap());

        let err = cache.resolve(&url).await.unwrap_err();
        assert_eq!(err.kind(), surge_core::ErrorKind::Dns);
        assert!(cache.resolve(&url).await.is_err());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ip_literal_skips_lookup() {
        let (cache, resolver) = cache(false);
        let url = Arc::new(Url::parse("http://127.0.0.1:9/").unwrap());
        let resolved = cache.resolve(&url).await.unwrap();
        assert_eq!(resolved.addrs.len(), 1);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }
}
