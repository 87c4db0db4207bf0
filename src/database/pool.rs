//! # Bounded Connection Pool
//!
//! One pool per logical database. A semaphore bounds the number of live
//! handles; idle connections sit on a LIFO stack so the warmest connection is
//! reused first and stale ones age out at the bottom.
//!
//! A [`PooledConnection`] is exclusive to its holder. [`PooledConnection::release`]
//! consumes the handle, so it cannot be returned twice; a handle dropped
//! without release is discarded and its slot freed.

use crate::config::DatabaseConfig;
use crate::database::driver::{ConnectionDriver, DriverConnection};
use crate::database::pool_stats::{AtomicPoolStats, PoolStatsSnapshot};
use crate::database::types::{LogicalDb, QueryResult, SqlParam};
use crate::error::{GatewayError, Result};
use crate::logging::log_pool_operation;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Idle connections older than this are pinged before reuse
const VALIDATE_AFTER_IDLE: Duration = Duration::from_secs(30);

struct IdleConnection {
    conn: Box<dyn DriverConnection>,
    idle_since: Instant,
}

struct PoolInner {
    db: LogicalDb,
    driver: Arc<dyn ConnectionDriver>,
    config: DatabaseConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
    stats: AtomicPoolStats,
    closed: AtomicBool,
}

impl std::fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("db", &self.db)
            .field("driver", &self.driver.kind())
            .field("max_connections", &self.config.pool.max_connections)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Bounded pool of driver connections for one logical database
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(db: LogicalDb, driver: Arc<dyn ConnectionDriver>, config: DatabaseConfig) -> Self {
        let max = config.pool.max_connections;
        info!(
            db = %db,
            driver = %driver.kind(),
            min_connections = config.pool.min_connections,
            max_connections = max,
            "Creating connection pool"
        );

        Self {
            inner: Arc::new(PoolInner {
                db,
                driver,
                semaphore: Arc::new(Semaphore::new(max as usize)),
                idle: Mutex::new(Vec::with_capacity(max as usize)),
                stats: AtomicPoolStats::new(db.connection_id().to_string(), max),
                closed: AtomicBool::new(false),
                config,
            }),
        }
    }

    pub fn db(&self) -> LogicalDb {
        self.inner.db
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Check out a connection, waiting at most the configured acquire
    /// timeout or until `deadline`, whichever comes first.
    pub async fn acquire(&self, deadline: Option<Instant>) -> Result<PooledConnection> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(GatewayError::ManagerClosed);
        }

        let started = Instant::now();
        let acquire_limit = started + inner.config.pool.acquire_timeout();
        let limit = deadline.map_or(acquire_limit, |d| d.min(acquire_limit));

        let permit = match tokio::time::timeout_at(limit, inner.semaphore.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(GatewayError::ManagerClosed),
            Err(_) => {
                inner.stats.record_error();
                warn!(
                    db = %inner.db,
                    waited_ms = started.elapsed().as_millis() as u64,
                    max_connections = inner.config.pool.max_connections,
                    "No pooled connection available before timeout"
                );
                return Err(GatewayError::PoolExhausted(format!(
                    "{}: no connection available within {}ms",
                    inner.db,
                    started.elapsed().as_millis()
                )));
            }
        };

        let conn = match self.checkout_idle().await {
            Some(conn) => conn,
            None => match self.open_connection(limit).await {
                Ok(conn) => conn,
                Err(err) => {
                    inner.stats.record_error();
                    return Err(err);
                }
            },
        };

        inner
            .stats
            .record_acquire(started.elapsed().as_micros() as u64);

        Ok(PooledConnection {
            conn: Some(conn),
            permit: Some(permit),
            pool: Arc::clone(inner),
            broken: false,
        })
    }

    /// Pop the most recently used idle connection that is still usable
    async fn checkout_idle(&self) -> Option<Box<dyn DriverConnection>> {
        let inner = &self.inner;
        let idle_timeout = inner.config.pool.idle_timeout();
        loop {
            let candidate = inner.idle.lock().pop()?;
            let idle_for = candidate.idle_since.elapsed();

            if idle_for > idle_timeout {
                debug!(db = %inner.db, idle_ms = idle_for.as_millis() as u64, "Discarding expired idle connection");
                inner.stats.record_discard();
                candidate.conn.close().await;
                continue;
            }

            let mut conn = candidate.conn;
            if idle_for > VALIDATE_AFTER_IDLE && !conn.is_valid().await {
                debug!(db = %inner.db, "Discarding idle connection that failed validation");
                inner.stats.record_discard();
                conn.close().await;
                continue;
            }
            return Some(conn);
        }
    }

    async fn open_connection(&self, limit: Instant) -> Result<Box<dyn DriverConnection>> {
        let inner = &self.inner;
        let connect_limit = limit.min(Instant::now() + inner.config.connect_timeout());
        let conn = tokio::time::timeout_at(connect_limit, inner.driver.connect(inner.db, &inner.config))
            .await
            .map_err(|_| {
                GatewayError::Timeout(format!("{}: connect timed out", inner.db))
            })??;
        inner.stats.record_open();
        debug!(db = %inner.db, driver = %inner.driver.kind(), "Opened new connection");
        Ok(conn)
    }

    /// Open connections until `min_connections` are idle. Best effort.
    pub async fn warm_up(&self) -> usize {
        let inner = &self.inner;
        let target = inner.config.pool.min_connections as usize;
        let mut opened = 0;
        loop {
            let idle = inner.idle.lock().len();
            if idle >= target || self.is_closed() {
                break;
            }
            let limit = Instant::now() + inner.config.connect_timeout();
            match self.open_connection(limit).await {
                Ok(conn) => {
                    inner.idle.lock().push(IdleConnection {
                        conn,
                        idle_since: Instant::now(),
                    });
                    opened += 1;
                }
                Err(err) => {
                    warn!(db = %inner.db, error = %err, "Pool warm-up stopped early");
                    break;
                }
            }
        }
        opened
    }

    /// Close every idle connection and refuse further acquires.
    ///
    /// Handles already checked out are closed when they are released.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.semaphore.close();
        let drained: Vec<IdleConnection> = std::mem::take(&mut *inner.idle.lock());
        let count = drained.len();
        for idle in drained {
            idle.conn.close().await;
        }
        log_pool_operation(
            &inner.db.to_string(),
            "close",
            "closed",
            None,
            Some(count as u32),
            None,
        );
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        let inner = &self.inner;
        let idle = inner.idle.lock().len();
        let max = inner.config.pool.max_connections as usize;
        let in_use = if self.is_closed() {
            0
        } else {
            max.saturating_sub(inner.semaphore.available_permits())
        };
        inner.stats.snapshot(idle, in_use)
    }
}

/// Exclusive handle to one pooled connection
pub struct PooledConnection {
    conn: Option<Box<dyn DriverConnection>>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
    broken: bool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("db", &self.pool.db)
            .field("broken", &self.broken)
            .finish()
    }
}

impl PooledConnection {
    pub fn db(&self) -> LogicalDb {
        self.pool.db
    }

    /// Run a statement; transport-level failures mark the handle broken so it
    /// is discarded on release.
    pub async fn query(&mut self, sql: &str, params: &[SqlParam]) -> Result<QueryResult> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| GatewayError::Internal("pooled connection already released".into()))?;

        let result = conn.query(sql, params).await;
        if let Err(err) = &result {
            if matches!(
                err,
                GatewayError::ConnectionReset(_) | GatewayError::Connection(_) | GatewayError::Timeout(_)
            ) {
                self.broken = true;
            }
        }
        result
    }

    /// Drop the connection instead of recycling it
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Return the connection to its pool (or close it if broken or the pool
    /// is closed). Consumes the handle.
    pub async fn release(mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        pool.stats.record_release();

        if self.broken || pool.closed.load(Ordering::Acquire) {
            pool.stats.record_discard();
            conn.close().await;
        } else {
            pool.idle.lock().push(IdleConnection {
                conn,
                idle_since: Instant::now(),
            });
        }
        // Slot is freed only after the connection is back on the stack.
        drop(self.permit.take());
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.pool.stats.record_discard();
            debug!(db = %self.pool.db, "Pooled connection dropped without release, discarding");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedDriver;

    fn pool_config(max: u32, acquire_timeout_ms: u64) -> DatabaseConfig {
        let mut config = DatabaseConfig::default();
        config.pool.min_connections = 1;
        config.pool.max_connections = max;
        config.pool.acquire_timeout_ms = acquire_timeout_ms;
        config
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_connection() {
        let driver = Arc::new(ScriptedDriver::new());
        let pool = ConnectionPool::new(LogicalDb::Emp, driver.clone(), pool_config(2, 100));

        let mut conn = pool.acquire(None).await.unwrap();
        conn.query("SELECT 1", &[]).await.unwrap();
        conn.release().await;

        let conn = pool.acquire(None).await.unwrap();
        conn.release().await;

        assert_eq!(driver.connects(), 1);
        let stats = pool.stats();
        assert_eq!(stats.total_acquires, 2);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let driver = Arc::new(ScriptedDriver::new());
        let pool = ConnectionPool::new(LogicalDb::Mult, driver, pool_config(1, 30));

        let held = pool.acquire(None).await.unwrap();
        let err = pool.acquire(None).await.unwrap_err();
        assert!(matches!(err, GatewayError::PoolExhausted(_)));
        assert_eq!(pool.stats().acquire_errors, 1);

        held.release().await;
        assert!(pool.acquire(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_handle_frees_slot_and_discards() {
        let driver = Arc::new(ScriptedDriver::new());
        let pool = ConnectionPool::new(LogicalDb::Emp, driver.clone(), pool_config(1, 30));

        {
            let _conn = pool.acquire(None).await.unwrap();
        }

        let conn = pool.acquire(None).await.unwrap();
        conn.release().await;
        assert_eq!(driver.connects(), 2);
        assert_eq!(pool.stats().connections_discarded, 1);
    }

    #[tokio::test]
    async fn test_broken_connection_not_recycled() {
        let driver = Arc::new(ScriptedDriver::new());
        driver.fail_next_queries(1, GatewayError::ConnectionReset("peer".into()));
        let pool = ConnectionPool::new(LogicalDb::Emp, driver.clone(), pool_config(2, 100));

        let mut conn = pool.acquire(None).await.unwrap();
        assert!(conn.query("SELECT 1", &[]).await.is_err());
        conn.release().await;

        assert_eq!(pool.stats().idle, 0);
        let conn = pool.acquire(None).await.unwrap();
        conn.release().await;
        assert_eq!(driver.connects(), 2);
    }

    #[tokio::test]
    async fn test_close_rejects_acquire() {
        let driver = Arc::new(ScriptedDriver::new());
        let pool = ConnectionPool::new(LogicalDb::Emp, driver.clone(), pool_config(2, 100));
        assert_eq!(pool.warm_up().await, 1);

        pool.close().await;
        pool.close().await;
        assert!(matches!(
            pool.acquire(None).await,
            Err(GatewayError::ManagerClosed)
        ));
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(driver.closes(), 1);
    }
}
