//! Connection pool for authenticated remote transports
//!
//! TLS handshakes against the remote are expensive; the pool keeps a bounded
//! set of idle, already-authenticated transports and hands them out one
//! logical stream at a time. Entries age out on two clocks: total lifetime
//! since creation and idle time since last use. Stale entries are closed at
//! acquire time rather than by a background sweeper.
//!
//! Invariants:
//! - live connections (idle + checked out) never exceed `max_cap`;
//! - the idle list never exceeds `max_idle`;
//! - an entry is held by at most one acquirer at a time;
//! - a released entry that is unusable, or that would overflow the idle list,
//!   is closed instead of pooled.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

pub use crate::transport::{AsyncStream, TransportStream};

type FactoryFuture = Pin<Box<dyn Future<Output = io::Result<TransportStream>> + Send>>;

/// Synthesizes a fresh authenticated transport to the remote
pub type Factory = Arc<dyn Fn() -> FactoryFuture + Send + Sync>;

/// Pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool is closed")]
    Closed,

    #[error("Transport factory failed: {0}")]
    Factory(#[from] io::Error),
}

/// Pool sizing and aging configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Entries created eagerly at startup
    pub initial_cap: usize,
    /// Upper bound on live connections
    pub max_cap: usize,
    /// Upper bound on idle connections
    pub max_idle: usize,
    /// An entry idle longer than this is closed at acquire
    pub idle_time: Duration,
    /// An entry older than this is closed at acquire regardless of use
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_cap: 10,
            max_cap: 50,
            max_idle: 10,
            idle_time: Duration::from_secs(5 * 60),
            max_lifetime: Duration::from_secs(30 * 60),
        }
    }
}

/// A checked-out pool entry.
///
/// Holds its capacity permit for as long as the connection lives; dropping a
/// `PooledConn` closes the transport and frees the slot.
pub struct PooledConn {
    stream: TransportStream,
    created: Instant,
    last_used: Instant,
    _permit: OwnedSemaphorePermit,
}

impl PooledConn {
    /// Age since the factory produced this transport
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    fn expired(&self, config: &PoolConfig) -> bool {
        self.created.elapsed() >= config.max_lifetime
            || self.last_used.elapsed() >= config.idle_time
    }
}

impl AsyncRead for PooledConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Idle-aged, capped pool of remote transports
pub struct Pool {
    idle: Mutex<Vec<PooledConn>>,
    permits: Arc<Semaphore>,
    factory: Factory,
    config: PoolConfig,
    closed: AtomicBool,
}

impl Pool {
    pub fn new(config: PoolConfig, factory: Factory) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::with_capacity(config.max_idle)),
            permits: Arc::new(Semaphore::new(config.max_cap)),
            factory,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Eagerly create `initial_cap` idle entries.
    ///
    /// Factory failures are logged, not fatal; the pool fills lazily later.
    pub async fn warm_up(&self) {
        for _ in 0..self.config.initial_cap.min(self.config.max_idle) {
            let permit = match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(p) => p,
                Err(_) => return,
            };
            match (self.factory)().await {
                Ok(stream) => {
                    let now = Instant::now();
                    self.idle.lock().await.push(PooledConn {
                        stream,
                        created: now,
                        last_used: now,
                        _permit: permit,
                    });
                }
                Err(e) => {
                    warn!("pool warm-up dial failed: {}", e);
                    return;
                }
            }
        }
        let entries = self.idle.lock().await.len();
        debug!(entries, "pool warmed up");
    }

    /// Check out a transport, reusing the most recently returned idle entry.
    ///
    /// Stale idle entries are closed and skipped. With no fresh idle entry
    /// the factory runs, waiting for a capacity slot first; callers bound the
    /// wait with their own dial timeout.
    pub async fn acquire(&self) -> Result<PooledConn, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        loop {
            let candidate = self.idle.lock().await.pop();
            match candidate {
                Some(mut conn) => {
                    if conn.expired(&self.config) {
                        debug!("closing stale pooled transport");
                        continue;
                    }
                    conn.last_used = Instant::now();
                    return Ok(conn);
                }
                None => break,
            }
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let stream = (self.factory)().await?;
        let now = Instant::now();
        Ok(PooledConn {
            stream,
            created: now,
            last_used: now,
            _permit: permit,
        })
    }

    /// Return a transport.
    ///
    /// A non-reusable entry, a closed pool, or a full idle list all close it.
    pub async fn release(&self, mut conn: PooledConn, reusable: bool) {
        if !reusable || self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut idle = self.idle.lock().await;
        if idle.len() >= self.config.max_idle {
            return;
        }
        conn.last_used = Instant::now();
        idle.push(conn);
    }

    /// Close every idle entry and refuse further acquires
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        self.idle.lock().await.clear();
    }

    /// Number of idle entries right now
    pub async fn idle_len(&self) -> usize {
        self.idle.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::{TcpListener, TcpStream};

    async fn echo_listener() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = sock.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn tcp_factory(addr: std::net::SocketAddr, dials: Arc<AtomicUsize>) -> Factory {
        Arc::new(move || {
            let dials = Arc::clone(&dials);
            Box::pin(async move {
                dials.fetch_add(1, Ordering::SeqCst);
                let stream = TcpStream::connect(addr).await?;
                Ok(Box::new(stream) as TransportStream)
            })
        })
    }

    #[tokio::test]
    async fn test_acquire_release_reuses() {
        let addr = echo_listener().await;
        let dials = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(PoolConfig::default(), tcp_factory(addr, Arc::clone(&dials)));

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, true).await;
        assert_eq!(pool.idle_len().await, 1);

        let _conn = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_len().await, 0);
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_reusable_release_closes() {
        let addr = echo_listener().await;
        let dials = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(PoolConfig::default(), tcp_factory(addr, Arc::clone(&dials)));

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, false).await;
        assert_eq!(pool.idle_len().await, 0);

        let _conn = pool.acquire().await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_idle_expiry_on_acquire() {
        let addr = echo_listener().await;
        let dials = Arc::new(AtomicUsize::new(0));
        let config = PoolConfig {
            idle_time: Duration::from_millis(20),
            ..PoolConfig::default()
        };
        let pool = Pool::new(config, tcp_factory(addr, Arc::clone(&dials)));

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, true).await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        // The idle entry aged out: acquire must dial afresh
        let _conn = pool.acquire().await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_max_idle_bound() {
        let addr = echo_listener().await;
        let dials = Arc::new(AtomicUsize::new(0));
        let config = PoolConfig {
            max_idle: 1,
            ..PoolConfig::default()
        };
        let pool = Pool::new(config, tcp_factory(addr, dials));

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a, true).await;
        pool.release(b, true).await;

        assert_eq!(pool.idle_len().await, 1);
    }

    #[tokio::test]
    async fn test_exclusive_checkout() {
        let addr = echo_listener().await;
        let dials = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(PoolConfig::default(), tcp_factory(addr, dials));

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, true).await;

        // Concurrent acquirers must never share the one idle entry
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.acquire().await.unwrap()
            }));
        }
        let mut conns = Vec::new();
        for h in handles {
            conns.push(h.await.unwrap());
        }
        assert_eq!(conns.len(), 8);
        assert_eq!(pool.idle_len().await, 0);
    }

    #[tokio::test]
    async fn test_close_refuses_acquire() {
        let addr = echo_listener().await;
        let dials = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(PoolConfig::default(), tcp_factory(addr, dials));

        let conn = pool.acquire().await.unwrap();
        pool.release(conn, true).await;
        pool.close().await;

        assert_eq!(pool.idle_len().await, 0);
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn test_warm_up() {
        let addr = echo_listener().await;
        let dials = Arc::new(AtomicUsize::new(0));
        let config = PoolConfig {
            initial_cap: 3,
            ..PoolConfig::default()
        };
        let pool = Pool::new(config, tcp_factory(addr, Arc::clone(&dials)));

        pool.warm_up().await;
        assert_eq!(pool.idle_len().await, 3);
        assert_eq!(dials.load(Ordering::SeqCst), 3);
    }
}
