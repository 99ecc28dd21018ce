//! In-process cache backend

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::CacheBackend;
use crate::error::Result;

/// Minimum time between sweeps of expired slots.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Slot {
    value: String,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
struct Slots {
    entries: HashMap<String, Slot>,
    swept_at: Option<Instant>,
}

impl Slots {
    /// Drop expired slots, at most once per [`SWEEP_INTERVAL`].
    fn sweep(&mut self, now: Instant) {
        if self
            .swept_at
            .is_some_and(|at| now.duration_since(at) < SWEEP_INTERVAL)
        {
            return;
        }
        self.entries.retain(|_, slot| slot.is_live(now));
        self.swept_at = Some(now);
    }
}

/// A [`CacheBackend`] kept in a map. Suitable for tests and single-process deployments.
///
/// Expired slots are removed when read, and swept in bulk on writes.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    slots: RwLock<Slots>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        {
            let slots = self.slots.read().await;
            match slots.entries.get(key) {
                None => return Ok(None),
                Some(slot) if slot.is_live(now) => return Ok(Some(slot.value.clone())),
                Some(_) => {}
            }
        }
        let mut slots = self.slots.write().await;
        if slots.entries.get(key).is_some_and(|slot| !slot.is_live(now)) {
            slots.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let expires_at = (!ttl.is_zero()).then(|| now + ttl);
        let mut slots = self.slots.write().await;
        slots.sweep(now);
        slots.entries.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut slots = self.slots.write().await;
        let removed = keys
            .iter()
            .filter(|k| slots.entries.remove(*k).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut slots = self.slots.write().await;
        let before = slots.entries.len();
        slots.entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - slots.entries.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.slots.write().await.entries.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let now = Instant::now();
        let slots = self.slots.read().await;
        Ok(slots.entries.values().filter(|slot| slot.is_live(now)).count())
    }
}
