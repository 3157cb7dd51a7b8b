//! Redis-backed store.
//!
//! Pending records live under `delivery:pending:{id}` with a native TTL. A client
//! confirmation moves the value to `delivery:confirmed:{id}` (keeping the remaining
//! TTL) in one Lua script, so the confirmation is observed exactly once and the
//! finalizing consumer can tell "confirmed" apart from "expired".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::Script;
use redis::aio::ConnectionManager;

use herald_common::redis_pool::create_redis_pool;
use herald_common::types::{DeliveryMetadata, PendingDeliveryRecord};

use super::{
    CONFIRMED_PREFIX, CounterStore, DEDUP_PREFIX, PENDING_PREFIX, PROCESSED_MARKER, DedupStore,
    PendingDeliveryStore, Resolution, StoreError, StoreResult, SweepReport,
};

/// KEYS[1] = pending key, KEYS[2] = confirmed key, ARGV[1] = fallback TTL in ms.
const CONFIRM_SCRIPT: &str = r#"
local record = redis.call('GET', KEYS[1])
if not record then
  return false
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl <= 0 then
  ttl = tonumber(ARGV[1])
end
redis.call('DEL', KEYS[1])
redis.call('SET', KEYS[2], record, 'PX', ttl)
return record
"#;

/// KEYS[1] = pending key, KEYS[2] = confirmed key.
const CLAIM_SCRIPT: &str = r#"
local record = redis.call('GET', KEYS[2])
if record then
  redis.call('DEL', KEYS[2])
  return {'confirmed', record}
end
if redis.call('EXISTS', KEYS[1]) == 1 then
  return {'pending'}
end
return {'absent'}
"#;

/// KEYS[1] = counter key, ARGV[1] = window in ms.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// KEYS[1] = dedup key, ARGV[1] = owner, ARGV[2] = TTL in ms.
const DEDUP_CLAIM_SCRIPT: &str = r#"
local holder = redis.call('GET', KEYS[1])
if holder and holder ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return 1
"#;

/// KEYS[1] = dedup key, ARGV[1] = owner.
const DEDUP_RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('DEL', KEYS[1])
end
return 1
"#;

/// Fallback TTL for a confirmed slot whose pending key had no TTL left.
const CONFIRMED_FALLBACK_TTL_MS: u64 = 60_000;

/// One shared Redis handle serving every store trait.
pub struct RedisStore {
    conn: ConnectionManager,
    confirm: Script,
    claim: Script,
    increment: Script,
    dedup_claim: Script,
    dedup_release: Script,
}

impl RedisStore {
    /// Connect to Redis at `redis_url` on a connection owned by this store.
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let conn = create_redis_pool(redis_url).await?;
        Ok(Self::from_manager(conn))
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self {
            conn,
            confirm: Script::new(CONFIRM_SCRIPT),
            claim: Script::new(CLAIM_SCRIPT),
            increment: Script::new(INCREMENT_SCRIPT),
            dedup_claim: Script::new(DEDUP_CLAIM_SCRIPT),
            dedup_release: Script::new(DEDUP_RELEASE_SCRIPT),
        }
    }

    /// Close the store's connection. Only the last owner closes it; while other
    /// owners remain the handle is released and `false` is returned.
    pub fn close(self: Arc<Self>) -> bool {
        match Arc::try_unwrap(self) {
            Ok(store) => {
                drop(store.conn);
                tracing::info!("Redis store connection closed");
                true
            }
            Err(shared) => {
                tracing::warn!(
                    owners = Arc::strong_count(&shared) - 1,
                    "Redis store still in use, connection closes with its last owner"
                );
                false
            }
        }
    }

    fn pending_key(message_id: &str) -> String {
        format!("{}{}", PENDING_PREFIX, message_id)
    }

    fn confirmed_key(message_id: &str) -> String {
        format!("{}{}", CONFIRMED_PREFIX, message_id)
    }

    fn decode(key: &str, raw: &str) -> StoreResult<PendingDeliveryRecord> {
        serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl PendingDeliveryStore for RedisStore {
    async fn store_pending_delivery(
        &self,
        message_id: &str,
        payload: serde_json::Value,
        metadata: DeliveryMetadata,
        ttl: Duration,
    ) -> StoreResult<()> {
        let record = PendingDeliveryRecord {
            message_id: message_id.to_string(),
            payload,
            metadata,
        };
        let value = serde_json::to_string(&record).map_err(|e| StoreError::Corrupt {
            key: Self::pending_key(message_id),
            reason: e.to_string(),
        })?;
        let ttl_ms = (ttl.as_millis() as u64).max(1);

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(Self::pending_key(message_id))
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .ignore()
            .del(Self::confirmed_key(message_id))
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn is_pending(&self, message_id: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(Self::pending_key(message_id)).await?;
        Ok(exists)
    }

    async fn confirm_delivery(&self, message_id: &str) -> StoreResult<Option<PendingDeliveryRecord>> {
        let pending_key = Self::pending_key(message_id);
        let mut conn = self.conn.clone();
        let raw: Option<String> = self
            .confirm
            .key(&pending_key)
            .key(Self::confirmed_key(message_id))
            .arg(CONFIRMED_FALLBACK_TTL_MS)
            .invoke_async(&mut conn)
            .await?;

        raw.map(|raw| Self::decode(&pending_key, &raw)).transpose()
    }

    async fn claim_resolution(&self, message_id: &str) -> StoreResult<Resolution> {
        let confirmed_key = Self::confirmed_key(message_id);
        let mut conn = self.conn.clone();
        let reply: Vec<String> = self
            .claim
            .key(Self::pending_key(message_id))
            .key(&confirmed_key)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [state, raw] if state == "confirmed" => {
                Ok(Resolution::Confirmed(Self::decode(&confirmed_key, raw)?))
            }
            [state] if state == "pending" => Ok(Resolution::Pending),
            _ => Ok(Resolution::Absent),
        }
    }

    async fn remove_pending_delivery(&self, message_id: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(vec![
            Self::pending_key(message_id),
            Self::confirmed_key(message_id),
        ])
        .await?;
        Ok(())
    }

    async fn list_pending(&self) -> StoreResult<Vec<PendingDeliveryRecord>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = {
            let mut iter = conn
                .scan_match::<_, String>(format!("{}*", PENDING_PREFIX))
                .await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            // The key may have expired between SCAN and GET.
            let raw: Option<String> = conn.get(&key).await?;
            if let Some(raw) = raw {
                records.push(Self::decode(&key, &raw)?);
            }
        }
        Ok(records)
    }

    async fn sweep(&self) -> StoreResult<SweepReport> {
        // Redis expires keys natively; the sweep only reports what is outstanding.
        let pending = self.list_pending().await?.len();
        Ok(SweepReport {
            pending,
            evicted: 0,
        })
    }
}

#[async_trait]
impl DedupStore for RedisStore {
    async fn try_claim(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let claimed: i64 = self
            .dedup_claim
            .key(format!("{}{}", DEDUP_PREFIX, key))
            .arg(owner)
            .arg((ttl.as_millis() as u64).max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(claimed == 1)
    }

    async fn release(&self, key: &str, owner: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .dedup_release
            .key(format!("{}{}", DEDUP_PREFIX, key))
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn mark_processed(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.pset_ex::<_, _, ()>(
            format!("{}{}", DEDUP_PREFIX, key),
            PROCESSED_MARKER,
            (ttl.as_millis() as u64).max(1),
        )
        .await?;
        Ok(())
    }

    async fn is_processed(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(format!("{}{}", DEDUP_PREFIX, key)).await?;
        Ok(value.as_deref() == Some(PROCESSED_MARKER))
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment_in_window(&self, key: &str, window: Duration) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .increment
            .key(key)
            .arg((window.as_millis() as u64).max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }
}
