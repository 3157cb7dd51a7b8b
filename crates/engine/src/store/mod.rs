//! Shared key-value store with per-key expiry.
//!
//! Three concerns live on the same backing store:
//! - pending delivery records (the source of truth for "awaiting acknowledgement")
//! - dedup keys for the resilient consumers
//! - fixed-window rate-limit counters
//!
//! Correctness relies on the store's atomic primitives only; callers hold no locks.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use herald_common::types::{DeliveryMetadata, PendingDeliveryRecord};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// What the finalizing consumer finds when it checks a recipient message.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// No acknowledgement yet; the record is still staged.
    Pending,
    /// The client acknowledged. The record is returned to exactly one claimer.
    Confirmed(PendingDeliveryRecord),
    /// Neither staged nor confirmed: expired, or removed after a client-side failure.
    Absent,
}

/// Outcome of one auto-cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records still awaiting confirmation after the pass.
    pub pending: usize,
    /// Records evicted because their TTL had passed.
    pub evicted: usize,
}

#[async_trait]
pub trait PendingDeliveryStore: Send + Sync {
    /// Stage a record. Overwrites any record with the same id.
    async fn store_pending_delivery(
        &self,
        message_id: &str,
        payload: serde_json::Value,
        metadata: DeliveryMetadata,
        ttl: Duration,
    ) -> StoreResult<()>;

    async fn is_pending(&self, message_id: &str) -> StoreResult<bool>;

    /// Client-side acknowledgement. Atomically moves the staged record to the
    /// confirmed slot and returns it; concurrent callers for the same id get `None`.
    async fn confirm_delivery(&self, message_id: &str) -> StoreResult<Option<PendingDeliveryRecord>>;

    /// Consumer-side check. A confirmed record is handed out once and then dropped.
    async fn claim_resolution(&self, message_id: &str) -> StoreResult<Resolution>;

    /// Idempotent removal of both the staged and the confirmed slot.
    async fn remove_pending_delivery(&self, message_id: &str) -> StoreResult<()>;

    async fn list_pending(&self) -> StoreResult<Vec<PendingDeliveryRecord>>;

    /// Evict expired records in stores without native expiry and count the rest.
    async fn sweep(&self) -> StoreResult<SweepReport>;

    /// Sleep until `timeout` elapses or, where the store can tell, until some
    /// delivery changes state. Returning early is only a hint to re-check.
    async fn wait_for_change(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}

/// Marker value of a dedup key whose operation completed.
pub(crate) const PROCESSED_MARKER: &str = "processed";

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically take `key` for `owner` before processing. Returns `false` when
    /// the key is already processed or held by another owner. Re-claiming a key
    /// the same owner still holds succeeds and refreshes its TTL.
    async fn try_claim(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool>;

    /// Give up a claim after failed processing. Only the holder's claim is dropped.
    async fn release(&self, key: &str, owner: &str) -> StoreResult<()>;

    /// Replace the claim with a processed marker for `ttl`.
    async fn mark_processed(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    async fn is_processed(&self, key: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and return the new count. The first increment of a window
    /// starts the window's expiry; later increments leave it untouched.
    async fn increment_in_window(&self, key: &str, window: Duration) -> StoreResult<u64>;
}

pub(crate) const PENDING_PREFIX: &str = "delivery:pending:";
pub(crate) const CONFIRMED_PREFIX: &str = "delivery:confirmed:";
pub(crate) const DEDUP_PREFIX: &str = "dedup:";
