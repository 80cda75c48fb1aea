use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod keys;

pub mod memory;
pub use memory::MemoryStore;

pub mod sqlite;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("wrong type for key {0}")]
    WrongType(String),
    #[error("value at {0} is not an integer")]
    NotInteger(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// The shared key-value store every request process coordinates through.
///
/// Values are opaque strings (records are JSON). Expired keys are invisible to
/// every operation. Each method is a single atomic step against the store; no
/// caller ever holds a lock across two calls.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Conditional set. Returns `true` only for the caller that wrote the value.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomic increment; a missing key counts as 0. Keeps any existing TTL.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Lowest-score member; ties broken by member order.
    async fn zfirst(&self, key: &str) -> Result<Option<(String, f64)>, StoreError>;

    /// Returns `true` only for the caller that actually removed the member.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn scard(&self, key: &str) -> Result<u64, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;
}

pub(crate) fn expiry(now_ms: u64, ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|t| now_ms.saturating_add(t.as_millis() as u64))
}

/// Minimum clock time between two sweeps of every expired key.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Schedules the opportunistic full sweeps that reclaim expired keys nobody reads again.
pub(crate) struct Sweeper {
    next_at: AtomicU64,
}

impl Sweeper {
    pub(crate) fn new() -> Self {
        Self {
            next_at: AtomicU64::new(0),
        }
    }

    /// True for one caller per interval.
    pub(crate) fn due(&self, now_ms: u64) -> bool {
        let next = self.next_at.load(Ordering::Acquire);
        if now_ms < next {
            return false;
        }
        let following = now_ms.saturating_add(SWEEP_INTERVAL.as_millis() as u64);
        self.next_at
            .compare_exchange(next, following, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweeps_once_per_interval() {
        let sweeper = Sweeper::new();
        assert!(sweeper.due(1_000));
        assert!(!sweeper.due(1_000));
        assert!(!sweeper.due(1_000 + 59_999));
        assert!(sweeper.due(1_000 + 60_000));
        assert!(!sweeper.due(1_000 + 60_001));
    }
}
