//! In-process store for tests and single-node development.
//!
//! Expiry is lazy: reads treat expired entries as absent, and `sweep` removes them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use herald_common::types::{DeliveryMetadata, PendingDeliveryRecord};

use super::{
    CounterStore, DedupStore, PROCESSED_MARKER, PendingDeliveryStore, Resolution, StoreError,
    StoreResult, SweepReport,
};

#[derive(Debug, Clone)]
struct Entry {
    record: PendingDeliveryRecord,
    expires_at: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct Inner {
    pending: HashMap<String, Entry>,
    confirmed: HashMap<String, Entry>,
    dedup: HashMap<String, (String, Instant)>,
    counters: HashMap<String, (u64, Instant)>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    changed: Notify,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live staged records (test helper).
    pub fn pending_count(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .pending
            .values()
            .filter(|e| e.live(now))
            .count()
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the maps half-updated,
        // so a poisoned guard is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PendingDeliveryStore for MemoryStore {
    async fn store_pending_delivery(
        &self,
        message_id: &str,
        payload: serde_json::Value,
        metadata: DeliveryMetadata,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.check()?;
        let entry = Entry {
            record: PendingDeliveryRecord {
                message_id: message_id.to_string(),
                payload,
                metadata,
            },
            expires_at: Instant::now() + ttl,
        };
        let mut inner = self.lock();
        inner.confirmed.remove(message_id);
        inner.pending.insert(message_id.to_string(), entry);
        Ok(())
    }

    async fn is_pending(&self, message_id: &str) -> StoreResult<bool> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .lock()
            .pending
            .get(message_id)
            .is_some_and(|e| e.live(now)))
    }

    async fn confirm_delivery(&self, message_id: &str) -> StoreResult<Option<PendingDeliveryRecord>> {
        self.check()?;
        let now = Instant::now();
        let record = {
            let mut inner = self.lock();
            match inner.pending.remove(message_id) {
                Some(entry) if entry.live(now) => {
                    let record = entry.record.clone();
                    inner.confirmed.insert(message_id.to_string(), entry);
                    Some(record)
                }
                _ => None,
            }
        };
        if record.is_some() {
            self.changed.notify_waiters();
        }
        Ok(record)
    }

    async fn claim_resolution(&self, message_id: &str) -> StoreResult<Resolution> {
        self.check()?;
        let now = Instant::now();
        let mut inner = self.lock();
        if let Some(entry) = inner.confirmed.remove(message_id)
            && entry.live(now)
        {
            return Ok(Resolution::Confirmed(entry.record));
        }
        if inner.pending.get(message_id).is_some_and(|e| e.live(now)) {
            return Ok(Resolution::Pending);
        }
        Ok(Resolution::Absent)
    }

    async fn remove_pending_delivery(&self, message_id: &str) -> StoreResult<()> {
        self.check()?;
        {
            let mut inner = self.lock();
            inner.pending.remove(message_id);
            inner.confirmed.remove(message_id);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn list_pending(&self) -> StoreResult<Vec<PendingDeliveryRecord>> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .lock()
            .pending
            .values()
            .filter(|e| e.live(now))
            .map(|e| e.record.clone())
            .collect())
    }

    async fn sweep(&self) -> StoreResult<SweepReport> {
        self.check()?;
        let now = Instant::now();
        let mut inner = self.lock();

        let before = inner.pending.len() + inner.confirmed.len();
        inner.pending.retain(|_, e| e.live(now));
        inner.confirmed.retain(|_, e| e.live(now));
        inner.dedup.retain(|_, (_, expires_at)| *expires_at > now);
        inner.counters.retain(|_, (_, expires_at)| *expires_at > now);
        let after = inner.pending.len() + inner.confirmed.len();

        Ok(SweepReport {
            pending: inner.pending.len(),
            evicted: before - after,
        })
    }

    async fn wait_for_change(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.changed.notified()).await;
    }
}

#[async_trait]
impl DedupStore for MemoryStore {
    async fn try_claim(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.dedup.get(key) {
            Some((holder, expires_at)) if *expires_at > now && holder != owner => Ok(false),
            _ => {
                inner.dedup.insert(key.to_string(), (owner.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, owner: &str) -> StoreResult<()> {
        self.check()?;
        let mut inner = self.lock();
        if inner.dedup.get(key).is_some_and(|(holder, _)| holder == owner) {
            inner.dedup.remove(key);
        }
        Ok(())
    }

    async fn mark_processed(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.check()?;
        self.lock().dedup.insert(
            key.to_string(),
            (PROCESSED_MARKER.to_string(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn is_processed(&self, key: &str) -> StoreResult<bool> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .lock()
            .dedup
            .get(key)
            .is_some_and(|(holder, expires_at)| *expires_at > now && holder == PROCESSED_MARKER))
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment_in_window(&self, key: &str, window: Duration) -> StoreResult<u64> {
        self.check()?;
        let now = Instant::now();
        let mut inner = self.lock();
        let slot = inner
            .counters
            .entry(key.to_string())
            .or_insert((0, now + window));
        if slot.1 <= now {
            *slot = (0, now + window);
        }
        slot.0 += 1;
        Ok(slot.0)
    }
}
