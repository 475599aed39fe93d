use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Result, VolatileStore};
use crate::error::StorageError;

struct Entry {
    data: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

// Expired entries are dropped on access and by the periodic sweep.
#[derive(Default)]
pub struct InMemoryVolatileStore {
    map: DashMap<String, Entry>,
}

impl InMemoryVolatileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VolatileStore for InMemoryVolatileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.map.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.data.clone()));
            }
            drop(entry);
            self.map.remove_if(key, |_, e| e.is_expired());
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.map
            .insert(key.to_string(), Entry::new(value.to_vec(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.map.remove(key);
        Ok(())
    }

    async fn add(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        match self.map.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired() {
                    return Ok(false);
                }
                occupied.insert(Entry::new(value.to_vec(), ttl));
                Ok(true)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Entry::new(value.to_vec(), ttl));
                Ok(true)
            }
        }
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        // The shard write lock held by `entry` makes read-modify-write atomic.
        let mut entry = self
            .map
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(b"0".to_vec(), ttl));
        if entry.is_expired() {
            *entry = Entry::new(b"0".to_vec(), ttl);
        }

        let current = std::str::from_utf8(&entry.data)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| StorageError::Corrupt(format!("non-integer counter at {}", key)))?;
        let next = current + delta;
        entry.data = next.to_string().into_bytes();
        Ok(next)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let before = self.map.len();
        self.map.retain(|_, e| !e.is_expired());
        Ok(before.saturating_sub(self.map.len()) as u64)
    }
}
