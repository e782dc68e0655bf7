//! In-process store backed by a concurrent map.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::{self, BoxFuture, FutureExt};

use crate::store::{CounterStore, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_at(&self, key: &str, ttl: Duration, now: Instant) -> Result<u64, StoreError> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: now + ttl,
        });
        if !entry.live(now) {
            *entry = Entry {
                value: "0".to_string(),
                expires_at: now + ttl,
            };
        }
        let current: u64 = entry
            .value
            .parse()
            .map_err(|_| StoreError::NotAnInteger(key.to_string()))?;
        let next = current.saturating_add(1);
        entry.value = next.to_string();
        Ok(next)
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<String> {
        self.entries
            .get(key)
            .filter(|entry| entry.live(now))
            .map(|entry| entry.value.clone())
    }

    pub fn set_at(&self, key: &str, value: String, ttl: Duration, now: Instant) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.live(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CounterStore for MemoryStore {
    fn incr<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, Result<u64, StoreError>> {
        future::ready(self.incr_at(key, ttl, Instant::now())).boxed()
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>> {
        future::ready(Ok(self.get_at(key, Instant::now()))).boxed()
    }

    fn get_many<'a>(
        &'a self,
        keys: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Option<String>>, StoreError>> {
        let now = Instant::now();
        let values = keys.iter().map(|key| self.get_at(key, now)).collect();
        future::ready(Ok(values)).boxed()
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.set_at(key, value, ttl, Instant::now());
        future::ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_expires_and_restarts() {
        let store = MemoryStore::new();
        let t0 = Instant::now();
        let ttl = Duration::from_secs(60);
        assert_eq!(store.incr_at("k", ttl, t0).unwrap(), 1);
        assert_eq!(store.incr_at("k", ttl, t0 + Duration::from_secs(1)).unwrap(), 2);
        assert_eq!(store.incr_at("k", ttl, t0 + Duration::from_secs(61)).unwrap(), 1);
    }

    #[test]
    fn incr_rejects_text() {
        let store = MemoryStore::new();
        let now = Instant::now();
        store.set_at("k", "{}".into(), Duration::from_secs(5), now);
        assert_eq!(
            store.incr_at("k", Duration::from_secs(5), now),
            Err(StoreError::NotAnInteger("k".into()))
        );
    }

    #[test]
    fn expired_values_read_as_absent_and_are_swept() {
        let store = MemoryStore::new();
        let now = Instant::now();
        store.set_at("a", "1".into(), Duration::from_secs(1), now);
        store.set_at("b", "2".into(), Duration::from_secs(10), now);
        let later = now + Duration::from_secs(2);
        assert_eq!(store.get_at("a", later), None);
        assert_eq!(store.get_at("b", later).as_deref(), Some("2"));
        assert_eq!(store.sweep_at(later), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn trait_methods_round_trip() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(30);
        assert_eq!(store.incr("hits", ttl).await.unwrap(), 1);
        store.set("name", "edge".into(), ttl).await.unwrap();
        let keys = vec!["hits".to_string(), "missing".to_string(), "name".to_string()];
        let values = store.get_many(&keys).await.unwrap();
        assert_eq!(values, vec![Some("1".into()), None, Some("edge".into())]);
    }
}
