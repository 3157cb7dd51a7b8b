//! Redis Streams broker.
//!
//! - one stream per queue, one consumer group per queue
//! - `XREADGROUP` hands out deliveries, `XACK` + `XDEL` settles them
//! - requeue and dead-letter append a new entry and settle the old one in a
//!   single `MULTI` block, so a message is never lost or duplicated by the broker
//!   itself
//! - entries left pending by a crashed consumer are taken over with `XCLAIM`

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};

use super::{
    Broker, BrokerError, DEATH_REASON_HEADER, Delivery, FAILED_AT_HEADER, MessageHeaders,
    ORIGINAL_QUEUE_HEADER, QueueMessage, QueueTopology, RETRY_COUNT_HEADER,
};

/// Default consumer group name.
const DEFAULT_GROUP: &str = "herald";

#[derive(Clone)]
pub struct RedisStreamsBroker {
    conn: ConnectionManager,
    group: String,
}

impl RedisStreamsBroker {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            group: DEFAULT_GROUP.to_string(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    async fn ensure_group(&self, stream: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        // "0" so a freshly created group also sees entries published before it existed.
        let result: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(stream, &self.group, "0").await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn to_delivery(queue: &str, entry: StreamId) -> Delivery {
        // A missing payload field yields an empty payload, which the consumer
        // dead-letters as malformed.
        let payload: Vec<u8> = entry.get("payload").unwrap_or_default();
        let retry_count: u32 = entry.get(RETRY_COUNT_HEADER).unwrap_or(0);

        Delivery {
            queue: queue.to_string(),
            tag: entry.id,
            message: QueueMessage {
                payload,
                headers: MessageHeaders { retry_count },
            },
        }
    }

    fn fields(message: &QueueMessage) -> Vec<(&'static str, Vec<u8>)> {
        vec![
            ("payload", message.payload.clone()),
            (
                RETRY_COUNT_HEADER,
                message.headers.retry_count.to_string().into_bytes(),
            ),
        ]
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    async fn declare(&self, topology: &QueueTopology) -> Result<(), BrokerError> {
        self.ensure_group(&topology.queue).await?;
        self.ensure_group(&topology.dead_letter_queue).await?;

        tracing::info!(
            queue = %topology.queue,
            dead_letter_queue = %topology.dead_letter_queue,
            group = %self.group,
            "Queue declared"
        );
        Ok(())
    }

    async fn publish(&self, queue: &str, message: QueueMessage) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: String = conn.xadd(queue, "*", &Self::fields(&message)).await?;
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &str,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let options = StreamReadOptions::default()
            .group(&self.group, consumer)
            .count(max);

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn.xread_options(&[queue], &[">"], &options).await?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(|entry| Self::to_delivery(queue, entry))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .xack(&delivery.queue, &self.group, &[&delivery.tag])
            .ignore()
            .xdel(&delivery.queue, &[&delivery.tag])
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, headers: MessageHeaders) -> Result<(), BrokerError> {
        let message = QueueMessage {
            payload: delivery.message.payload.clone(),
            headers,
        };

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .xadd(&delivery.queue, "*", &Self::fields(&message))
            .ignore()
            .xack(&delivery.queue, &self.group, &[&delivery.tag])
            .ignore()
            .xdel(&delivery.queue, &[&delivery.tag])
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        dead_letter_queue: &str,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let mut fields = Self::fields(&delivery.message);
        fields.push((DEATH_REASON_HEADER, reason.as_bytes().to_vec()));
        fields.push((ORIGINAL_QUEUE_HEADER, delivery.queue.as_bytes().to_vec()));
        fields.push((
            FAILED_AT_HEADER,
            chrono::Utc::now().to_rfc3339().into_bytes(),
        ));

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .xadd(dead_letter_queue, "*", &fields)
            .ignore()
            .xack(&delivery.queue, &self.group, &[&delivery.tag])
            .ignore()
            .xdel(&delivery.queue, &[&delivery.tag])
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn reclaim_idle(
        &self,
        queue: &str,
        consumer: &str,
        min_idle: Duration,
        max: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let min_idle_ms = min_idle.as_millis() as usize;
        let mut conn = self.conn.clone();

        let pending: StreamPendingCountReply = conn
            .xpending_count(queue, &self.group, "-", "+", max)
            .await?;
        let idle: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| p.id)
            .collect();

        if idle.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = conn
            .xclaim(queue, &self.group, consumer, min_idle_ms, &idle)
            .await?;

        tracing::info!(
            queue,
            consumer,
            reclaimed = claimed.ids.len(),
            "Reclaimed idle deliveries"
        );

        Ok(claimed
            .ids
            .into_iter()
            .map(|entry| Self::to_delivery(queue, entry))
            .collect())
    }
}
