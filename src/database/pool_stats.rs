//! # Connection Pool Statistics
//!
//! SWMR (Single Writer, Multiple Reader) atomic statistics for the per-database
//! pools. Hot-path recording uses `Relaxed` ordering; readers take snapshots.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Acquires slower than this are counted as slow
pub const SLOW_ACQUIRE_THRESHOLD_US: u64 = 100_000;

/// Atomic connection pool statistics.
#[derive(Debug)]
pub struct AtomicPoolStats {
    /// Pool identifier (connection id)
    pool_name: String,

    max_connections: u32,

    /// Total successful acquires
    total_acquires: AtomicU64,

    /// Total acquire time in microseconds (for average computation)
    total_acquire_time_us: AtomicU64,

    /// Number of acquires exceeding the slow threshold
    slow_acquires: AtomicU64,

    /// Maximum acquire time observed (in microseconds)
    max_acquire_time_us: AtomicU64,

    /// Acquires that timed out waiting for a slot or failed to connect
    acquire_errors: AtomicU64,

    /// Physical connections opened through the driver
    connections_opened: AtomicU64,

    /// Connections closed instead of being returned to the idle stack
    connections_discarded: AtomicU64,

    /// Handles returned to the pool
    releases: AtomicU64,
}

impl AtomicPoolStats {
    pub fn new(pool_name: String, max_connections: u32) -> Self {
        Self {
            pool_name,
            max_connections,
            total_acquires: AtomicU64::new(0),
            total_acquire_time_us: AtomicU64::new(0),
            slow_acquires: AtomicU64::new(0),
            max_acquire_time_us: AtomicU64::new(0),
            acquire_errors: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_discarded: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    /// Record a successful connection acquire.
    #[inline]
    pub fn record_acquire(&self, duration_us: u64) {
        self.total_acquires.fetch_add(1, Ordering::Relaxed);
        self.total_acquire_time_us
            .fetch_add(duration_us, Ordering::Relaxed);
        self.max_acquire_time_us
            .fetch_max(duration_us, Ordering::Relaxed);

        if duration_us >= SLOW_ACQUIRE_THRESHOLD_US {
            self.slow_acquires.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an acquire error (timeout, pool exhaustion, connect failure).
    #[inline]
    pub fn record_error(&self) {
        self.acquire_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_open(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_discard(&self) {
        self.connections_discarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot; `idle` and `in_use` are supplied by the pool.
    pub fn snapshot(&self, idle: usize, in_use: usize) -> PoolStatsSnapshot {
        let total_acquires = self.total_acquires.load(Ordering::Relaxed);
        let total_acquire_time_us = self.total_acquire_time_us.load(Ordering::Relaxed);

        let average_acquire_time_us = if total_acquires > 0 {
            total_acquire_time_us as f64 / total_acquires as f64
        } else {
            0.0
        };

        PoolStatsSnapshot {
            pool_name: self.pool_name.clone(),
            max_connections: self.max_connections,
            idle,
            in_use,
            total_acquires,
            slow_acquires: self.slow_acquires.load(Ordering::Relaxed),
            acquire_errors: self.acquire_errors.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_discarded: self.connections_discarded.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            average_acquire_time_us,
            max_acquire_time_us: self.max_acquire_time_us.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatsSnapshot {
    pub pool_name: String,
    pub max_connections: u32,
    pub idle: usize,
    pub in_use: usize,
    pub total_acquires: u64,
    pub slow_acquires: u64,
    pub acquire_errors: u64,
    pub connections_opened: u64,
    pub connections_discarded: u64,
    pub releases: u64,
    pub average_acquire_time_us: f64,
    pub max_acquire_time_us: u64,
}
