use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use relay_types::{Clock, SystemClock};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::{expiry, SharedStore, StoreError, Sweeper};

pub type DbPool = Pool<SqliteConnectionManager>;

/// Store backed by a SQLite file shared by every process that opens it.
///
/// Read-modify-write operations run inside `IMMEDIATE` transactions, so two
/// processes racing on the same key serialize on the database write lock.
/// Strings, sorted sets and sets live in separate tables.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    sweeper: Arc<Sweeper>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);
CREATE TABLE IF NOT EXISTS zset (
    key TEXT NOT NULL,
    member TEXT NOT NULL,
    score REAL NOT NULL,
    PRIMARY KEY (key, member)
);
CREATE INDEX IF NOT EXISTS zset_by_score ON zset (key, score, member);
CREATE TABLE IF NOT EXISTS sset (
    key TEXT NOT NULL,
    member TEXT NOT NULL,
    PRIMARY KEY (key, member)
);
";

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
            }
        }
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
            Ok(())
        });
        let pool = Pool::builder().max_size(8).build(manager)?;
        Self::from_pool(pool, clock)
    }

    /// Private in-memory database; one connection so every handle sees the same data.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        Self::from_pool(pool, clock)
    }

    pub fn from_pool(pool: DbPool, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);
        Ok(Self {
            pool,
            clock,
            sweeper: Arc::new(Sweeper::new()),
        })
    }

    /// Physically delete expired string keys.
    ///
    /// Normal traffic runs the same sweep at most once per [`crate::SWEEP_INTERVAL`].
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_ms();
        self.blocking(now, false, |conn, now| purge_all(conn, now)).await
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, u64) -> rusqlite::Result<T> + Send + 'static,
    {
        let now = self.clock.now_ms();
        let sweep = self.sweeper.due(now);
        self.blocking(now, sweep, f).await
    }

    async fn blocking<T, F>(&self, now: u64, sweep: bool, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, u64) -> rusqlite::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            if sweep {
                purge_all(&conn, now)?;
            }
            f(&mut *conn, now).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
    }
}

fn purge_all(conn: &Connection, now: u64) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        params![now as i64],
    )
}

fn purge_key(conn: &Connection, key: &str, now: u64) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM kv WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
        params![key, now as i64],
    )
}

#[async_trait]
impl SharedStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.run(move |conn, now| {
            conn.query_row(
                "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now as i64],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.run(move |conn, now| {
            conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expiry(now, ttl).map(|v| v as i64)],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.run(move |conn, now| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            purge_key(&tx, &key, now)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, expiry(now, ttl).map(|v| v as i64)],
            )?;
            tx.commit()?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.run(move |conn, now| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            purge_key(&tx, &key, now)?;
            let mut removed = tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            removed += tx.execute("DELETE FROM zset WHERE key = ?1", params![key])?;
            removed += tx.execute("DELETE FROM sset WHERE key = ?1", params![key])?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let name = key.to_string();
        let key = key.to_string();
        let outcome = self
            .run(move |conn, now| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                purge_key(&tx, &key, now)?;
                let current: Option<String> = tx
                    .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
                    .optional()?;
                let parsed = match current {
                    None => Some(0),
                    Some(s) => s.trim().parse::<i64>().ok(),
                };
                let Some(n) = parsed else {
                    return Ok(None);
                };
                let next = n + 1;
                tx.execute(
                    "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, NULL)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, next.to_string()],
                )?;
                tx.commit()?;
                Ok(Some(next))
            })
            .await?;
        outcome.ok_or(StoreError::NotInteger(name))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let (key, member) = (key.to_string(), member.to_string());
        self.run(move |conn, _| {
            conn.execute(
                "INSERT INTO zset (key, member, score) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key, member) DO UPDATE SET score = excluded.score",
                params![key, member, score],
            )?;
            Ok(())
        })
        .await
    }

    async fn zfirst(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        let key = key.to_string();
        self.run(move |conn, _| {
            conn.query_row(
                "SELECT member, score FROM zset WHERE key = ?1 ORDER BY score ASC, member ASC LIMIT 1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })
        .await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let (key, member) = (key.to_string(), member.to_string());
        self.run(move |conn, _| {
            let n = conn.execute(
                "DELETE FROM zset WHERE key = ?1 AND member = ?2",
                params![key, member],
            )?;
            Ok(n == 1)
        })
        .await
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let key = key.to_string();
        self.run(move |conn, _| {
            conn.query_row("SELECT COUNT(*) FROM zset WHERE key = ?1", params![key], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as u64)
        })
        .await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let (key, member) = (key.to_string(), member.to_string());
        self.run(move |conn, _| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO sset (key, member) VALUES (?1, ?2)",
                params![key, member],
            )?;
            Ok(n == 1)
        })
        .await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let (key, member) = (key.to_string(), member.to_string());
        self.run(move |conn, _| {
            let n = conn.execute(
                "DELETE FROM sset WHERE key = ?1 AND member = ?2",
                params![key, member],
            )?;
            Ok(n == 1)
        })
        .await
    }

    async fn scard(&self, key: &str) -> Result<u64, StoreError> {
        let key = key.to_string();
        self.run(move |conn, _| {
            conn.query_row("SELECT COUNT(*) FROM sset WHERE key = ?1", params![key], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as u64)
        })
        .await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let key = key.to_string();
        self.run(move |conn, _| {
            let mut stmt = conn.prepare("SELECT member FROM sset WHERE key = ?1 ORDER BY member")?;
            let members = stmt
                .query_map(params![key], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(members)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::ManualClock;

    fn store() -> (Arc<ManualClock>, SqliteStore) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = SqliteStore::in_memory(clock.clone()).unwrap();
        (clock, store)
    }

    #[tokio::test]
    async fn expired_values_are_invisible_and_reclaimable() {
        let (clock, store) = store();
        store.set("k", "v", Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "again", None).await.unwrap());
        assert!(!store.set_if_absent("k", "late", None).await.unwrap());
    }

    #[tokio::test]
    async fn traffic_sweeps_expired_rows() {
        let (clock, store) = store();
        for i in 0..50 {
            store
                .set(&format!("job:{i}"), "{}", Some(Duration::from_secs(1)))
                .await
                .unwrap();
        }
        clock.advance(crate::SWEEP_INTERVAL);
        assert_eq!(store.get("unrelated").await.unwrap(), None);
        assert_eq!(store.purge_expired().await.unwrap(), 0);

        store.set("short", "v", Some(Duration::from_millis(10))).await.unwrap();
        clock.advance(Duration::from_millis(10));
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn incr_is_counted_and_rejects_text() {
        let (_, store) = store();
        assert_eq!(store.incr("n").await.unwrap(), 1);
        assert_eq!(store.incr("n").await.unwrap(), 2);
        store.set("t", "nope", None).await.unwrap();
        assert!(matches!(store.incr("t").await, Err(StoreError::NotInteger(_))));
    }

    #[tokio::test]
    async fn sorted_set_orders_by_score_then_member() {
        let (_, store) = store();
        store.zadd("q", "j5", 5.0).await.unwrap();
        store.zadd("q", "j1b", 1.0).await.unwrap();
        store.zadd("q", "j1a", 1.0).await.unwrap();
        assert_eq!(store.zfirst("q").await.unwrap(), Some(("j1a".into(), 1.0)));
        assert!(store.zrem("q", "j1a").await.unwrap());
        assert!(!store.zrem("q", "j1a").await.unwrap());
        assert_eq!(store.zcard("q").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn delete_clears_every_structure() {
        let (_, store) = store();
        store.sadd("x", "m").await.unwrap();
        assert!(store.delete("x").await.unwrap());
        assert_eq!(store.scard("x").await.unwrap(), 0);
        assert!(!store.delete("x").await.unwrap());
    }
}
