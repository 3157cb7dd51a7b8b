//! Queue broker abstraction with manual acknowledgement.
//!
//! Queues are named `{domain}.{action}`; each has a sibling dead-letter queue
//! `dlq.{domain}.{action}`. Retry state travels with the message in the
//! `x-retry-count` header.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use herald_common::types::queues::dead_letter_queue;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisStreamsBroker;

pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
pub const DEATH_REASON_HEADER: &str = "x-death-reason";
pub const ORIGINAL_QUEUE_HEADER: &str = "x-original-queue";
pub const FAILED_AT_HEADER: &str = "x-failed-at";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("unknown delivery {0}")]
    UnknownDelivery(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<::redis::RedisError> for BrokerError {
    fn from(err: ::redis::RedisError) -> Self {
        BrokerError::Unavailable(err.to_string())
    }
}

/// Transport headers the consumer reads and rewrites.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    /// Failed attempts so far. Absent on the wire means zero.
    pub retry_count: u32,
}

/// Queue message envelope: opaque payload bytes plus headers.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub payload: Vec<u8>,
    pub headers: MessageHeaders,
}

impl QueueMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            headers: MessageHeaders::default(),
        }
    }

    /// Serialize `value` as the UTF-8 JSON payload of a fresh message.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, BrokerError> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }
}

/// A message handed to a consumer and not yet settled.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub queue: String,
    /// Broker-assigned identifier used to settle this delivery.
    pub tag: String,
    pub message: QueueMessage,
}

/// A primary queue and its dead-letter sibling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub queue: String,
    pub dead_letter_queue: String,
}

impl QueueTopology {
    /// Topology with the conventional `dlq.` sibling.
    pub fn for_queue(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            dead_letter_queue: dead_letter_queue(queue),
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Idempotently create the queue and its dead-letter queue.
    async fn declare(&self, topology: &QueueTopology) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, message: QueueMessage) -> Result<(), BrokerError>;

    /// Fetch up to `max` new deliveries for `consumer`. Returns immediately when
    /// nothing is available.
    async fn fetch(&self, queue: &str, consumer: &str, max: usize)
    -> Result<Vec<Delivery>, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Put the message back on its queue with `headers`, settling the original.
    async fn requeue(&self, delivery: &Delivery, headers: MessageHeaders) -> Result<(), BrokerError>;

    /// Route the message to `dead_letter_queue` permanently, settling the original.
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        dead_letter_queue: &str,
        reason: &str,
    ) -> Result<(), BrokerError>;

    /// Take over deliveries another consumer left unsettled for at least `min_idle`.
    async fn reclaim_idle(
        &self,
        _queue: &str,
        _consumer: &str,
        _min_idle: Duration,
        _max: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        Ok(Vec::new())
    }
}
