//! # Connection Pools
//!
//! One pool per protocol kind. A FIFO semaphore bounds the number of
//! connections checked out at once; released connections wait on an idle
//! list keyed by origin `(scheme, host, port)`. Every checkout re-validates
//! an idle connection and dials fresh when the check fails.
//!
//! ```text
//!   acquire(origin) ── permit (FIFO) ──► idle[origin].pop() ── open? ──► reuse
//!                                                   └─ empty/stale ──► dial
//!   release(conn, clean) ── clean ──► idle[origin].push()
//!                       └── dirty ──► drop (socket closed)
//! ```

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use surge_core::{Origin, ProtocolKind, SurgeError};

/// A connection a pool can hold
pub trait Poolable: Send + 'static {
    /// Cheap liveness check run before reuse
    fn is_open(&mut self) -> bool;
}

/// Pool statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub dials: u64,
    pub reuses: u64,
    /// Idle connections found closed at checkout
    pub stale: u64,
    pub clean_releases: u64,
    pub discards: u64,
}

struct PoolInner<C> {
    kind: ProtocolKind,
    max_concurrency: usize,
    max_idle_per_origin: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<HashMap<Origin, Vec<C>>>,
    stats: RwLock<PoolStats>,
}

/// Bounded pool of reusable connections
pub struct Pool<C: Poolable> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Poolable> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Poolable> Pool<C> {
    pub fn new(kind: ProtocolKind, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            inner: Arc::new(PoolInner {
                kind,
                max_concurrency,
                max_idle_per_origin: max_concurrency,
                permits: Arc::new(Semaphore::new(max_concurrency)),
                idle: Mutex::new(HashMap::new()),
                stats: RwLock::new(PoolStats::default()),
            }),
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        self.inner.kind
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Connections currently checked out
    pub fn outstanding(&self) -> usize {
        self.inner.max_concurrency - self.inner.permits.available_permits()
    }

    pub fn idle_count(&self, origin: &Origin) -> usize {
        self.inner.idle.lock().get(origin).map_or(0, Vec::len)
    }

    /// Check out a connection for `origin`, dialing with `dial` when no
    /// healthy idle connection exists. Waits FIFO when the pool is full.
    pub async fn acquire<F, Fut>(&self, origin: &Origin, dial: F) -> Result<Pooled<C>, SurgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, SurgeError>>,
    {
        let permit = self.acquire_permit().await?;

        if let Some(conn) = self.checkout_idle(origin) {
            return Ok(Pooled::new(self, origin, conn, permit, true));
        }

        let conn = dial().await?;
        self.inner.stats.write().dials += 1;
        trace!(kind = %self.inner.kind, %origin, "dialed new connection");
        Ok(Pooled::new(self, origin, conn, permit, false))
    }

    /// Check out a freshly dialed connection, bypassing the idle list
    pub async fn acquire_fresh<F, Fut>(
        &self,
        origin: &Origin,
        dial: F,
    ) -> Result<Pooled<C>, SurgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, SurgeError>>,
    {
        let permit = self.acquire_permit().await?;
        let conn = dial().await?;
        self.inner.stats.write().dials += 1;
        Ok(Pooled::new(self, origin, conn, permit, false))
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, SurgeError> {
        self.inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SurgeError::Cancelled)
    }

    fn checkout_idle(&self, origin: &Origin) -> Option<C> {
        let mut idle = self.inner.idle.lock();
        let list = idle.get_mut(origin)?;
        while let Some(mut conn) = list.pop() {
            if conn.is_open() {
                self.inner.stats.write().reuses += 1;
                return Some(conn);
            }
            self.inner.stats.write().stale += 1;
        }
        None
    }

    /// Return a connection; dirty connections are closed
    pub fn release(&self, conn: Pooled<C>, clean: bool) {
        conn.release(clean);
    }

    /// Drop every idle connection and refuse further checkouts
    pub fn close(&self) {
        self.inner.permits.close();
        self.inner.idle.lock().clear();
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats.read().clone()
    }
}

/// A checked-out connection.
///
/// Dropping it without [`Pooled::release`] counts as a dirty release: the
/// connection is closed and its permit returned.
pub struct Pooled<C: Poolable> {
    conn: Option<C>,
    origin: Origin,
    pool: Arc<PoolInner<C>>,
    _permit: OwnedSemaphorePermit,
    reused: bool,
}

impl<C: Poolable> Pooled<C> {
    fn new(
        pool: &Pool<C>,
        origin: &Origin,
        conn: C,
        permit: OwnedSemaphorePermit,
        reused: bool,
    ) -> Self {
        Self {
            conn: Some(conn),
            origin: origin.clone(),
            pool: pool.inner.clone(),
            _permit: permit,
            reused,
        }
    }

    /// Whether this connection came off the idle list
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn release(mut self, clean: bool) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if !clean || self.pool.permits.is_closed() {
            self.pool.stats.write().discards += 1;
            return;
        }
        let mut idle = self.pool.idle.lock();
        let list = idle.entry(self.origin.clone()).or_default();
        if list.len() < self.pool.max_idle_per_origin {
            list.push(conn);
            self.pool.stats.write().clean_releases += 1;
        } else {
            self.pool.stats.write().discards += 1;
        }
    }
}

impl<C: Poolable> Deref for Pooled<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("pooled connection used after release")
    }
}

impl<C: Poolable> DerefMut for Pooled<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("pooled connection used after release")
    }
}

impl<C: Poolable> Drop for Pooled<C> {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.pool.stats.write().discards += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeConn {
        id: usize,
        open: Arc<AtomicBool>,
    }

    impl Poolable for FakeConn {
        fn is_open(&mut self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    fn origin() -> Origin {
        Origin {
            scheme: "http".into(),
            host: "a.test".into(),
            port: 80,
        }
    }

    fn dialer(
        counter: &Arc<AtomicUsize>,
        open: &Arc<AtomicBool>,
    ) -> impl FnOnce() -> futures::future::Ready<Result<FakeConn, SurgeError>> {
        let id = counter.fetch_add(1, Ordering::SeqCst);
        let open = open.clone();
        move || futures::future::ready(Ok(FakeConn { id, open }))
    }

    #[tokio::test]
    async fn test_clean_release_reuses() {
        let pool = Pool::new(ProtocolKind::Http1, 2);
        let counter = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicBool::new(true));

        let conn = pool.acquire(&origin(), dialer(&counter, &open)).await.unwrap();
        assert!(!conn.is_reused());
        conn.release(true);

        let conn = pool.acquire(&origin(), dialer(&counter, &open)).await.unwrap();
        assert!(conn.is_reused());
        assert_eq!(conn.id, 0);
        conn.release(false);

        assert_eq!(pool.idle_count(&origin()), 0);
        let stats = pool.stats();
        assert_eq!(stats.dials, 1);
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.discards, 1);
    }

    #[tokio::test]
    async fn test_stale_idle_connection_is_redialed() {
        let pool = Pool::new(ProtocolKind::Http1, 1);
        let counter = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicBool::new(true));

        pool.acquire(&origin(), dialer(&counter, &open))
            .await
            .unwrap()
            .release(true);
        open.store(false, Ordering::SeqCst);

        let fresh_open = Arc::new(AtomicBool::new(true));
        let conn = pool.acquire(&origin(), dialer(&counter, &fresh_open)).await.unwrap();
        assert!(!conn.is_reused());
        assert_eq!(pool.stats().stale, 1);
    }

    #[tokio::test]
    async fn test_semaphore_bounds_outstanding() {
        let pool = Pool::new(ProtocolKind::Http1, 1);
        let counter = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicBool::new(true));

        let held = pool.acquire(&origin(), dialer(&counter, &open)).await.unwrap();
        assert_eq!(pool.outstanding(), 1);

        let waiter = {
            let pool = pool.clone();
            let counter = counter.clone();
            let open = open.clone();
            tokio::spawn(async move {
                let conn = pool.acquire(&origin(), dialer(&counter, &open)).await.unwrap();
                conn.id
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let id = waiter.await.unwrap();
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(id, 1);
    }
}
