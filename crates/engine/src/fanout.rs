//! Cross-instance realtime fan-out.
//!
//! Anything that wants to push to a room, whether a worker or a gateway
//! instance, publishes a [`FanoutMessage`] on the bus; every gateway instance
//! subscribes and forwards to its local sockets. The `origin` field lets an
//! instance skip messages it already delivered locally.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use herald_common::types::Room;

use crate::rate_limit::RateLimiter;

/// Buffered messages per subscriber of the in-process bus.
const MEMORY_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("fan-out bus unavailable: {0}")]
    Unavailable(String),

    #[error("fan-out serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for FanoutError {
    fn from(err: redis::RedisError) -> Self {
        FanoutError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutMessage {
    /// Instance id of the publisher.
    pub origin: String,
    pub room: Room,
    pub event: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait FanoutBus: Send + Sync {
    async fn publish(&self, message: &FanoutMessage) -> Result<(), FanoutError>;

    /// Subscribe to every message published from now on.
    async fn subscribe(&self) -> Result<BoxStream<'static, FanoutMessage>, FanoutError>;
}

/// Redis pub/sub bus on a single channel.
#[derive(Clone)]
pub struct RedisFanout {
    client: redis::Client,
    conn: ConnectionManager,
    channel: String,
}

impl RedisFanout {
    pub fn new(client: redis::Client, conn: ConnectionManager, channel: impl Into<String>) -> Self {
        Self {
            client,
            conn,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl FanoutBus for RedisFanout {
    async fn publish(&self, message: &FanoutMessage) -> Result<(), FanoutError> {
        let encoded = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        let _receivers: i64 = conn.publish(&self.channel, encoded).await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, FanoutMessage>, FanoutError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        tracing::info!(channel = %self.channel, "Subscribed to fan-out channel");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let raw: String = match msg.get_payload() {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(error = %e, "Unreadable fan-out payload");
                    return None;
                }
            };
            match serde_json::from_str::<FanoutMessage>(&raw) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed fan-out message");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// In-process bus. Instances sharing one `MemoryFanout` see each other's messages.
#[derive(Debug, Clone)]
pub struct MemoryFanout {
    tx: broadcast::Sender<FanoutMessage>,
}

impl MemoryFanout {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(MEMORY_BUS_CAPACITY);
        Self { tx }
    }
}

impl Default for MemoryFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FanoutBus for MemoryFanout {
    async fn publish(&self, message: &FanoutMessage) -> Result<(), FanoutError> {
        // No subscribers is not an error: nobody is connected.
        let _ = self.tx.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, FanoutMessage>, FanoutError> {
        let rx = self.tx.subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(message) => return Some((message, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Fan-out subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Whether an emit went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Sent,
    /// Dropped by the outbound rate limit.
    RateLimited,
}

/// Push surface used by the workers and the event bridge.
#[async_trait]
pub trait RealtimeEmitter: Send + Sync {
    async fn emit(
        &self,
        room: &Room,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<EmitOutcome, FanoutError>;
}

/// Emitter for processes without local sockets: rate-limit, then publish on the bus.
pub struct FanoutEmitter {
    bus: Arc<dyn FanoutBus>,
    limiter: Arc<RateLimiter>,
    origin: String,
}

impl FanoutEmitter {
    pub fn new(bus: Arc<dyn FanoutBus>, limiter: Arc<RateLimiter>, origin: impl Into<String>) -> Self {
        Self {
            bus,
            limiter,
            origin: origin.into(),
        }
    }
}

#[async_trait]
impl RealtimeEmitter for FanoutEmitter {
    async fn emit(
        &self,
        room: &Room,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<EmitOutcome, FanoutError> {
        if !self.limiter.check(&room.to_string(), event).await.allowed {
            return Ok(EmitOutcome::RateLimited);
        }

        self.bus
            .publish(&FanoutMessage {
                origin: self.origin.clone(),
                room: room.clone(),
                event: event.to_string(),
                payload,
            })
            .await?;
        Ok(EmitOutcome::Sent)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;
    use herald_common::config::RateLimitConfig;

    #[tokio::test]
    async fn test_memory_bus_delivers_to_every_subscriber() {
        let bus = MemoryFanout::new();
        let mut a = bus.subscribe().await.unwrap();
        let mut b = bus.subscribe().await.unwrap();

        let message = FanoutMessage {
            origin: "i1".to_string(),
            room: Room::tenant("c1"),
            event: "company.updated".to_string(),
            payload: json!({"name": "Acme"}),
        };
        bus.publish(&message).await.unwrap();

        assert_eq!(a.next().await.unwrap(), message);
        assert_eq!(b.next().await.unwrap(), message);
    }

    #[test]
    fn test_fanout_message_wire_format() {
        let message = FanoutMessage {
            origin: "i1".to_string(),
            room: Room::user("u1"),
            event: "notification.created".to_string(),
            payload: json!({"messageId": "msg_1_u1"}),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["room"], json!("user:u1"));
    }

    #[tokio::test]
    async fn test_emitter_drops_over_limit() {
        let bus = Arc::new(MemoryFanout::new());
        let mut rx = bus.subscribe().await.unwrap();
        let limiter = Arc::new(RateLimiter::outbound(
            Arc::new(MemoryStore::new()),
            RateLimitConfig::new(Duration::from_secs(60), 1),
        ));
        let emitter = FanoutEmitter::new(bus, limiter, "worker-1");

        let room = Room::user("u1");
        assert_eq!(
            emitter.emit(&room, "member.joined", json!({})).await.unwrap(),
            EmitOutcome::Sent
        );
        assert_eq!(
            emitter.emit(&room, "member.joined", json!({})).await.unwrap(),
            EmitOutcome::RateLimited
        );

        let received = rx.next().await.unwrap();
        assert_eq!(received.origin, "worker-1");
    }
}
