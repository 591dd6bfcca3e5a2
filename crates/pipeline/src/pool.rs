//! Warm connection pool for the STT/TTS vendor endpoints.
//!
//! One pool per `(endpoint, auth)` pair. The pool is the single owner of
//! idle sockets; a borrowed connection travels inside a guard that returns
//! it on drop unless the borrower marked it unhealthy, in which case it is
//! discarded and the next acquire dials a fresh one. `prewarm` fills the
//! pool in background tasks and never blocks the hot path.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::PipelineError;

/// Dials and validates connections for a specific endpoint.
#[async_trait]
pub trait StreamFactory: Send + Sync + 'static {
    type Conn: Send + 'static;

    /// Human-readable endpoint label for logs and errors.
    fn endpoint(&self) -> &str;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Conn, PipelineError>;

    /// Cheap liveness check run before lending an idle connection.
    async fn probe(&self, conn: &mut Self::Conn) -> bool;
}

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrent connections (borrowed + idle).
    pub max_size: usize,
    /// Idle connections older than this are evicted.
    pub idle_timeout: Duration,
    /// How long acquire may wait for capacity.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 4,
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
}

struct IdleConn<C> {
    conn: C,
    idle_since: Instant,
}

struct Shared<F: StreamFactory> {
    factory: F,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConn<F::Conn>>>,
    capacity: Arc<Semaphore>,
    stats: Mutex<PoolStats>,
}

/// Warm connection pool.
pub struct ConnectionPool<F: StreamFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: StreamFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<F: StreamFactory> ConnectionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let capacity = Arc::new(Semaphore::new(config.max_size.max(1)));
        Self {
            shared: Arc::new(Shared {
                factory,
                config,
                idle: Mutex::new(VecDeque::new()),
                capacity,
                stats: Mutex::new(PoolStats::default()),
            }),
        }
    }

    /// Borrow a connection, reusing a warm one when possible.
    pub async fn acquire(&self) -> Result<PooledConnection<F>, PipelineError> {
        let shared = &self.shared;
        let permit = tokio::time::timeout(
            shared.config.acquire_timeout,
            shared.capacity.clone().acquire_owned(),
        )
        .await
        .map_err(|_| PipelineError::PoolExhausted(shared.factory.endpoint().to_string()))?
        .map_err(|_| PipelineError::PoolExhausted(shared.factory.endpoint().to_string()))?;

        // Try warm connections first, validating each before lending.
        loop {
            let candidate = {
                let mut idle = shared.idle.lock();
                loop {
                    match idle.pop_front() {
                        Some(entry)
                            if entry.idle_since.elapsed() >= shared.config.idle_timeout =>
                        {
                            shared.stats.lock().discarded += 1;
                            continue;
                        }
                        other => break other,
                    }
                }
            };

            match candidate {
                Some(mut entry) => {
                    if shared.factory.probe(&mut entry.conn).await {
                        shared.stats.lock().reused += 1;
                        return Ok(PooledConnection {
                            conn: Some(entry.conn),
                            shared: shared.clone(),
                            healthy: true,
                            _permit: permit,
                        });
                    }
                    shared.stats.lock().discarded += 1;
                    tracing::debug!(
                        endpoint = shared.factory.endpoint(),
                        "Discarded stale pooled connection"
                    );
                }
                None => break,
            }
        }

        let conn = shared.factory.connect().await?;
        shared.stats.lock().created += 1;
        Ok(PooledConnection {
            conn: Some(conn),
            shared: shared.clone(),
            healthy: true,
            _permit: permit,
        })
    }

    /// Fill the pool with up to `k` warm connections in the background.
    pub fn prewarm(&self, k: usize) {
        for _ in 0..k {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let permit = match shared.capacity.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => return,
                };
                match shared.factory.connect().await {
                    Ok(conn) => {
                        shared.stats.lock().created += 1;
                        shared.idle.lock().push_back(IdleConn {
                            conn,
                            idle_since: Instant::now(),
                        });
                    }
                    Err(e) => {
                        tracing::warn!(
                            endpoint = shared.factory.endpoint(),
                            error = %e,
                            "Prewarm connect failed"
                        );
                    }
                }
                drop(permit);
            });
        }
    }

    /// Drop idle connections past the timeout; returns how many.
    pub fn evict_idle(&self) -> usize {
        let mut idle = self.shared.idle.lock();
        let before = idle.len();
        let timeout = self.shared.config.idle_timeout;
        idle.retain(|entry| entry.idle_since.elapsed() < timeout);
        let evicted = before - idle.len();
        if evicted > 0 {
            self.shared.stats.lock().discarded += evicted as u64;
        }
        evicted
    }

    /// Spawn the periodic idle sweep.
    pub fn start_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        let period = pool.shared.config.idle_timeout / 2;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
            loop {
                interval.tick().await;
                let evicted = pool.evict_idle();
                if evicted > 0 {
                    tracing::debug!(
                        endpoint = pool.shared.factory.endpoint(),
                        evicted,
                        "Evicted idle connections"
                    );
                }
            }
        })
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = *self.shared.stats.lock();
        stats.idle = self.shared.idle.lock().len();
        stats
    }
}

/// A borrowed connection. Returned to the pool on drop unless marked
/// unhealthy.
pub struct PooledConnection<F: StreamFactory> {
    conn: Option<F::Conn>,
    shared: Arc<Shared<F>>,
    healthy: bool,
    _permit: OwnedSemaphorePermit,
}

impl<F: StreamFactory> PooledConnection<F> {
    /// The borrower hit an error on this connection; do not reuse it.
    ///
    /// Idempotent: calling twice is the same as once.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub fn get_mut(&mut self) -> &mut F::Conn {
        self.conn.as_mut().expect("connection taken")
    }
}

impl<F: StreamFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.healthy {
                self.shared.idle.lock().push_back(IdleConn {
                    conn,
                    idle_since: Instant::now(),
                });
            } else {
                self.shared.stats.lock().discarded += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestFactory {
        connects: AtomicUsize,
        probe_ok: bool,
    }

    #[async_trait]
    impl StreamFactory for TestFactory {
        type Conn = usize;

        fn endpoint(&self) -> &str {
            "test"
        }

        async fn connect(&self) -> Result<usize, PipelineError> {
            Ok(self.connects.fetch_add(1, Ordering::SeqCst))
        }

        async fn probe(&self, _conn: &mut usize) -> bool {
            self.probe_ok
        }
    }

    fn pool(probe_ok: bool, max_size: usize) -> ConnectionPool<TestFactory> {
        ConnectionPool::new(
            TestFactory {
                connects: AtomicUsize::new(0),
                probe_ok,
            },
            PoolConfig {
                max_size,
                idle_timeout: Duration::from_secs(60),
                acquire_timeout: Duration::from_millis(100),
            },
        )
    }

    #[tokio::test]
    async fn reuses_released_connection() {
        let pool = pool(true, 2);
        let conn = pool.acquire().await.unwrap();
        drop(conn);
        let _conn = pool.acquire().await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
    }

    #[tokio::test]
    async fn unhealthy_connection_is_discarded() {
        let pool = pool(true, 2);
        let mut conn = pool.acquire().await.unwrap();
        conn.mark_unhealthy();
        drop(conn);

        let _conn = pool.acquire().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.discarded, 1);
    }

    #[tokio::test]
    async fn failing_probe_forces_fresh_dial() {
        let pool = pool(false, 2);
        drop(pool.acquire().await.unwrap());
        let _conn = pool.acquire().await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.reused, 0);
    }

    #[tokio::test]
    async fn capacity_limits_concurrent_borrows() {
        let pool = pool(true, 1);
        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await;
        assert!(matches!(err, Err(PipelineError::PoolExhausted(_))));
        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn prewarm_fills_idle() {
        let pool = pool(true, 4);
        pool.prewarm(2);
        // Give the background tasks a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().idle, 2);
    }
}
