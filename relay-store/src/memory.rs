use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_types::{Clock, SystemClock};
use tokio::sync::{Mutex, MutexGuard};

use crate::{expiry, SharedStore, StoreError, Sweeper};

/// Single-process store. Every operation takes one lock, so each call is atomic.
///
/// Suitable for tests and for a single long-running server; independent
/// processes need [`crate::SqliteStore`].
pub struct MemoryStore {
    inner: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    sweeper: Sweeper,
}

struct Entry {
    value: Slot,
    expires_at: Option<u64>,
}

enum Slot {
    Str(String),
    ZSet(HashMap<String, f64>),
    Set(HashSet<String>),
}

impl Entry {
    fn live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            clock,
            sweeper: Sweeper::new(),
        }
    }

    /// Drop every expired key. Reads already ignore them; this only reclaims memory.
    ///
    /// Normal traffic runs the same sweep at most once per [`crate::SWEEP_INTERVAL`].
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;
        sweep(&mut inner, now)
    }

    async fn lock(&self) -> (u64, MutexGuard<'_, HashMap<String, Entry>>) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock().await;
        if self.sweeper.due(now) {
            sweep(&mut inner, now);
        }
        (now, inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sweep(map: &mut HashMap<String, Entry>, now: u64) -> usize {
    let before = map.len();
    map.retain(|_, e| e.live(now));
    before - map.len()
}

fn purge(map: &mut HashMap<String, Entry>, key: &str, now: u64) {
    if map.get(key).map_or(false, |e| !e.live(now)) {
        map.remove(key);
    }
}

fn zset_mut<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut HashMap<String, f64>, StoreError> {
    let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
        value: Slot::ZSet(HashMap::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Slot::ZSet(z) => Ok(z),
        _ => Err(StoreError::WrongType(key.to_string())),
    }
}

fn set_mut<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut HashSet<String>, StoreError> {
    let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
        value: Slot::Set(HashSet::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Slot::Set(s) => Ok(s),
        _ => Err(StoreError::WrongType(key.to_string())),
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let (now, mut inner) = self.lock().await;
        purge(&mut inner, key, now);
        match inner.get(key) {
            None => Ok(None),
            Some(Entry { value: Slot::Str(s), .. }) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let (now, mut inner) = self.lock().await;
        purge(&mut inner, key, now);
        if let Some(Entry { value: Slot::ZSet(_) | Slot::Set(_), .. }) = inner.get(key) {
            return Err(StoreError::WrongType(key.to_string()));
        }
        inner.insert(
            key.to_string(),
            Entry {
                value: Slot::Str(value.to_string()),
                expires_at: expiry(now, ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let (now, mut inner) = self.lock().await;
        purge(&mut inner, key, now);
        if inner.contains_key(key) {
            return Ok(false);
        }
        inner.insert(
            key.to_string(),
            Entry {
                value: Slot::Str(value.to_string()),
                expires_at: expiry(now, ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let (now, mut inner) = self.lock().await;
        purge(&mut inner, key, now);
        Ok(inner.remove(key).is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let (now, mut inner) = self.lock().await;
        purge(&mut inner, key, now);
        let entry = inner.entry(key.to_string()).or_insert_with(|| Entry {
            value: Slot::Str("0".into()),
            expires_at: None,
        });
        let Slot::Str(s) = &mut entry.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        let n: i64 = s
            .trim()
            .parse()
            .map_err(|_| StoreError::NotInteger(key.to_string()))?;
        let next = n + 1;
        *s = next.to_string();
        Ok(next)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let (now, mut inner) = self.lock().await;
        purge(&mut inner, key, now);
        zset_mut(&mut inner, key)?.insert(member.to_string(), score);
        Ok(())
    }

    async fn zfirst(&self, key: &str) -> Result<Option<(String, f64)>, StoreError> {
        let (now, mut inner) = self.lock().await;
        purge(&mut inner, key, now);
        match inner.get(key) {
            None => Ok(None),
            Some(Entry { value: Slot::ZSet(z), .. }) => Ok(z
                .iter()
                .min_by(|a, b| a.1.total_cmp(b.1).then_with(|| a.0.cmp(b.0)))
                .map(|(m, s)| (m.clone(), *s))),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let (now, mut inner) = self.lock().await;
        purge(&mut inner, key, now);
        let removed = match inner.get_mut(key) {
            None => return Ok(false),
            Some(Entry { value: Slot::ZSet(z), .. }) => {
                let removed = z.remove(member).is_some();
                if z.is_empty() {
                    inner.remove(key);
                }
                removed
            }
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
        };
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let (now, mut inner) = self.lock().await;
        purge(&mut inner, key, now);
        match inner.get(key) {
            None => Ok(0),
            Some(Entry { value: Slot::ZSet(z), .. }) => Ok(z.len() as u64),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let (now, mut inner) = self.lock().await;
        purge(&mut inner, key, now);
        Ok(set_mut(&mut inner, key)?.insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let (now, mut inner) = self.lock().await;
        purge(&mut inner, key, now);
        let removed = match inner.get_mut(key) {
            None => return Ok(false),
            Some(Entry { value: Slot::Set(s), .. }) => {
                let removed = s.remove(member);
                if s.is_empty() {
                    inner.remove(key);
                }
                removed
            }
            Some(_) => return Err(StoreError::WrongType(key.to_string())),
        };
        Ok(removed)
    }

    async fn scard(&self, key: &str) -> Result<u64, StoreError> {
        let (now, mut inner) = self.lock().await;
        purge(&mut inner, key, now);
        match inner.get(key) {
            None => Ok(0),
            Some(Entry { value: Slot::Set(s), .. }) => Ok(s.len() as u64),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let (now, mut inner) = self.lock().await;
        purge(&mut inner, key, now);
        match inner.get(key) {
            None => Ok(Vec::new()),
            Some(Entry { value: Slot::Set(s), .. }) => {
                let mut members: Vec<String> = s.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }
}
