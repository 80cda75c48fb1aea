//! Replay cache for tool calls carrying an idempotency key.
//!
//! Keys are stored hashed (`idempotency:{sha256}`). Only successful results are
//! cached, so a failed call can always be retried under the same key.

use std::sync::Arc;
use std::time::Duration;

use relay_store::{keys, SharedStore, StoreError};
use relay_types::Clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub tool: String,
    pub request_id: String,
    pub result: Value,
    /// Epoch milliseconds.
    pub created_at: u64,
}

pub struct IdempotencyCache {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl IdempotencyCache {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self { store, clock, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Cached result for `key`, if one was stored within the window.
    pub async fn lookup(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let Some(raw) = self.store.get(&keys::idempotency(key)).await? else {
            return Ok(None);
        };
        let record: IdempotencyRecord = match serde_json::from_str(&raw) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "unreadable idempotency record ignored");
                return Ok(None);
            }
        };
        let age = self.clock.now_ms().saturating_sub(record.created_at);
        if age >= self.window.as_millis() as u64 {
            debug!(request_id = %record.request_id, age_ms = age, "idempotency record outside window");
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Remember a successful result. Call only after the tool succeeded.
    pub async fn store(
        &self,
        key: &str,
        tool: &str,
        request_id: &str,
        result: &Value,
    ) -> Result<(), StoreError> {
        let record = IdempotencyRecord {
            tool: tool.to_string(),
            request_id: request_id.to_string(),
            result: result.clone(),
            created_at: self.clock.now_ms(),
        };
        let raw = serde_json::to_string(&record).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.store
            .set(&keys::idempotency(key), &raw, Some(self.window))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::MemoryStore;
    use relay_types::ManualClock;
    use serde_json::json;

    fn cache(store: Arc<dyn SharedStore>, clock: Arc<ManualClock>) -> IdempotencyCache {
        IdempotencyCache::new(store, clock, DEFAULT_WINDOW)
    }

    #[tokio::test]
    async fn hit_within_window() {
        let clock = Arc::new(ManualClock::new(0));
        let c = cache(Arc::new(MemoryStore::with_clock(clock.clone())), clock.clone());
        assert!(c.lookup("k1").await.unwrap().is_none());

        c.store("k1", "search", "req-1", &json!({"hits": 2})).await.unwrap();
        clock.advance(Duration::from_secs(29 * 60));
        let hit = c.lookup("k1").await.unwrap().unwrap();
        assert_eq!(hit.result, json!({"hits": 2}));
        assert_eq!(hit.request_id, "req-1");
    }

    #[tokio::test]
    async fn record_older_than_window_is_ignored() {
        // Store TTL is disabled here so only the window check applies.
        let clock = Arc::new(ManualClock::new(0));
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::with_clock(clock.clone()));
        let stale = IdempotencyRecord {
            tool: "search".into(),
            request_id: "req-1".into(),
            result: json!(1),
            created_at: 0,
        };
        store
            .set(&keys::idempotency("k1"), &serde_json::to_string(&stale).unwrap(), None)
            .await
            .unwrap();
        let c = cache(store, clock.clone());
        clock.advance(DEFAULT_WINDOW);
        assert!(c.lookup("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_record_reads_as_miss() {
        let clock = Arc::new(ManualClock::new(0));
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::with_clock(clock.clone()));
        store.set(&keys::idempotency("k1"), "{oops", None).await.unwrap();
        assert!(cache(store, clock).lookup("k1").await.unwrap().is_none());
    }
}
