//! Resilient queue consumer.
//!
//! Per message:
//! `Received → DedupClaim → {Held: ack | Claimed: process} → {Ok: mark dedup, ack | Err: release, retry or dead-letter}`
//!
//! The claim is taken before processing, so concurrent copies of one logical
//! operation never run side by side.
//!
//! Business logic plugs in through [`Processor`]; the retry counter, dedup keys and
//! dead-letter routing are handled here and nowhere else.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinSet;

use herald_common::config::QueueSettings;
use herald_common::types::queues::dead_letter_queue;

use crate::broker::{Broker, BrokerError, Delivery, MessageHeaders, QueueTopology};
use crate::store::DedupStore;

/// Pause between fetches when the queue is empty.
const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(200);

/// Deliveries unsettled for this long are assumed orphaned by a dead consumer.
const DEFAULT_RECLAIM_AFTER: Duration = Duration::from_secs(300);

/// The single extension point for business logic.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send + 'static;

    /// Parse and validate a raw payload. An error here is structural: the message
    /// is dead-lettered without retry.
    fn decode(&self, payload: &[u8]) -> Result<Self::Payload, String> {
        serde_json::from_slice(payload).map_err(|e| e.to_string())
    }

    /// Key identifying the logical operation, or `None` to skip dedup.
    fn dedup_key(&self, payload: &Self::Payload) -> Option<String>;

    async fn process(&self, payload: Self::Payload) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    pub queue: String,
    pub dead_letter_queue: String,
    /// Maximum deliveries processed concurrently by this instance.
    pub prefetch: usize,
    /// Total attempts before a failing message is dead-lettered.
    pub max_retries: u32,
    pub dedup_ttl: Duration,
    pub consumer_name: String,
    pub idle_backoff: Duration,
    pub reclaim_after: Duration,
}

impl ConsumerConfig {
    pub fn new(queue: &str, settings: QueueSettings) -> Self {
        Self {
            queue: queue.to_string(),
            dead_letter_queue: dead_letter_queue(queue),
            prefetch: settings.prefetch.max(1),
            max_retries: settings.max_retries,
            dedup_ttl: settings.dedup_ttl,
            consumer_name: format!("{}-{}", queue, uuid::Uuid::new_v4().simple()),
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            reclaim_after: DEFAULT_RECLAIM_AFTER,
        }
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    pub fn with_idle_backoff(mut self, idle_backoff: Duration) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }

    pub fn with_reclaim_after(mut self, reclaim_after: Duration) -> Self {
        self.reclaim_after = reclaim_after;
        self
    }

    fn topology(&self) -> QueueTopology {
        QueueTopology {
            queue: self.queue.clone(),
            dead_letter_queue: self.dead_letter_queue.clone(),
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    Duplicate,
    Requeued { retry_count: u32 },
    DeadLettered { reason: String },
}

pub struct ResilientConsumer<P: Processor> {
    broker: Arc<dyn Broker>,
    dedup: Arc<dyn DedupStore>,
    processor: Arc<P>,
    config: ConsumerConfig,
}

impl<P: Processor> ResilientConsumer<P> {
    pub fn new(
        broker: Arc<dyn Broker>,
        dedup: Arc<dyn DedupStore>,
        processor: Arc<P>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            dedup,
            processor,
            config,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Declare the queue and its dead-letter binding.
    pub async fn start(&self) -> Result<(), BrokerError> {
        self.broker.declare(&self.config.topology()).await
    }

    /// Consume until `shutdown` flips to `true`. In-flight deliveries are abandoned
    /// on shutdown; the broker hands them out again later.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.start().await?;

        tracing::info!(
            queue = %self.config.queue,
            consumer = %self.config.consumer_name,
            prefetch = self.config.prefetch,
            max_retries = self.config.max_retries,
            "Consumer started"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut last_reclaim: Option<tokio::time::Instant> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    tracing::error!(queue = %self.config.queue, error = %e, "Delivery task panicked");
                }
            }

            let available = self.config.prefetch.saturating_sub(tasks.len());
            if available == 0 {
                tokio::select! {
                    _ = tasks.join_next() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let mut deliveries = Vec::new();
            if last_reclaim.is_none_or(|at| at.elapsed() >= self.config.reclaim_after) {
                last_reclaim = Some(tokio::time::Instant::now());
                match self
                    .broker
                    .reclaim_idle(
                        &self.config.queue,
                        &self.config.consumer_name,
                        self.config.reclaim_after,
                        available,
                    )
                    .await
                {
                    Ok(reclaimed) => deliveries.extend(reclaimed),
                    Err(e) => tracing::warn!(
                        queue = %self.config.queue,
                        error = %e,
                        "Failed to reclaim idle deliveries"
                    ),
                }
            }

            let remaining = available - deliveries.len().min(available);
            if remaining > 0 {
                match self
                    .broker
                    .fetch(&self.config.queue, &self.config.consumer_name, remaining)
                    .await
                {
                    Ok(fetched) => deliveries.extend(fetched),
                    Err(e) => tracing::warn!(
                        queue = %self.config.queue,
                        error = %e,
                        "Failed to fetch deliveries"
                    ),
                }
            }

            if deliveries.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_backoff) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for delivery in deliveries {
                let this = self.clone();
                tasks.spawn(async move {
                    let tag = delivery.tag.clone();
                    if let Err(e) = this.handle(delivery).await {
                        // The delivery stays unsettled and is reclaimed later.
                        tracing::error!(
                            queue = %this.config.queue,
                            tag = %tag,
                            error = %e,
                            "Failed to settle delivery"
                        );
                    }
                });
            }
        }

        tasks.shutdown().await;
        tracing::info!(queue = %self.config.queue, "Consumer stopped");
        Ok(())
    }

    /// Fetch and handle deliveries until the queue is empty. Batches of up to
    /// `prefetch` are processed concurrently.
    pub async fn drain(&self) -> Result<Vec<Outcome>, BrokerError> {
        self.start().await?;
        let mut outcomes = Vec::new();

        loop {
            let batch = self
                .broker
                .fetch(
                    &self.config.queue,
                    &self.config.consumer_name,
                    self.config.prefetch,
                )
                .await?;
            if batch.is_empty() {
                return Ok(outcomes);
            }

            let results =
                futures::future::join_all(batch.into_iter().map(|d| self.handle(d))).await;
            for result in results {
                outcomes.push(result?);
            }
        }
    }

    /// Run one delivery through the state machine and settle it with the broker.
    pub async fn handle(&self, delivery: Delivery) -> Result<Outcome, BrokerError> {
        let payload = match self.processor.decode(&delivery.message.payload) {
            Ok(payload) => payload,
            Err(reason) => {
                let reason = format!("malformed payload: {}", reason);
                tracing::warn!(
                    queue = %self.config.queue,
                    tag = %delivery.tag,
                    reason = %reason,
                    "Dead-lettering malformed message"
                );
                self.broker
                    .dead_letter(&delivery, &self.config.dead_letter_queue, &reason)
                    .await?;
                return Ok(Outcome::DeadLettered { reason });
            }
        };

        let dedup_key = self.processor.dedup_key(&payload);
        if let Some(key) = &dedup_key {
            match self
                .dedup
                .try_claim(key, &delivery.tag, self.config.dedup_ttl)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(
                        queue = %self.config.queue,
                        dedup_key = %key,
                        "Duplicate message acknowledged without processing"
                    );
                    self.broker.ack(&delivery).await?;
                    return Ok(Outcome::Duplicate);
                }
                Err(e) => return self.fail(&delivery, anyhow::Error::new(e)).await,
            }
        }

        match self.processor.process(payload).await {
            Ok(()) => {
                if let Some(key) = &dedup_key
                    && let Err(e) = self.dedup.mark_processed(key, self.config.dedup_ttl).await
                {
                    // The claim stays in place, so the redelivery is settled as a duplicate.
                    tracing::error!(
                        queue = %self.config.queue,
                        dedup_key = %key,
                        error = %e,
                        "Failed to record dedup key after processing"
                    );
                    return self.fail(&delivery, anyhow::Error::new(e)).await;
                }
                self.broker.ack(&delivery).await?;
                Ok(Outcome::Processed)
            }
            Err(e) => {
                if let Some(key) = &dedup_key
                    && let Err(release_err) = self.dedup.release(key, &delivery.tag).await
                {
                    tracing::warn!(
                        queue = %self.config.queue,
                        dedup_key = %key,
                        error = %release_err,
                        "Failed to release dedup claim; it lapses after the dedup TTL"
                    );
                }
                self.fail(&delivery, e).await
            }
        }
    }

    async fn fail(&self, delivery: &Delivery, error: anyhow::Error) -> Result<Outcome, BrokerError> {
        let retry_count = delivery.message.headers.retry_count + 1;

        if retry_count >= self.config.max_retries {
            let reason = format!("failed after {} attempts: {:#}", retry_count, error);
            tracing::error!(
                queue = %self.config.queue,
                tag = %delivery.tag,
                retry_count,
                error = %error,
                "Retries exhausted, dead-lettering message"
            );
            self.broker
                .dead_letter(delivery, &self.config.dead_letter_queue, &reason)
                .await?;
            return Ok(Outcome::DeadLettered { reason });
        }

        tracing::warn!(
            queue = %self.config.queue,
            tag = %delivery.tag,
            retry_count,
            max_retries = self.config.max_retries,
            error = %error,
            "Processing failed, requeueing"
        );
        self.broker
            .requeue(delivery, MessageHeaders { retry_count })
            .await?;
        Ok(Outcome::Requeued { retry_count })
    }
}
