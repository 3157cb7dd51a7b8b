//! Delivery-aware consumption.
//!
//! A [`DeliveryHandler`] receives a base message id and reports a
//! [`DeliveryOutcome`]. Jobs with a dedup key keep the same base id across
//! retries, so recipients persisted by an earlier attempt are not persisted again.
//! The adapter turns an unconfirmed outcome into a failure so the resilient
//! consumer retries it, and clears every record the attempt staged on success.
//!
//! [`ConfirmationWait`] is the polling half of the handshake: it watches a set of
//! staged recipient messages until each is acknowledged, vanishes, or the deadline
//! passes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::time::Instant;

use herald_common::config::DeliveryConfig;
use herald_common::types::PendingDeliveryRecord;

use crate::consumer::Processor;
use crate::store::{PendingDeliveryStore, Resolution};

/// Result of one delivery attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Every recipient reached a persisted terminal state.
    pub confirmed: bool,
    /// At least one notification was persisted.
    pub saved: bool,
    pub error: Option<String>,
    /// Recipient message ids staged during the attempt.
    pub staged: Vec<String>,
}

impl DeliveryOutcome {
    pub fn confirmed(saved: bool) -> Self {
        Self {
            confirmed: true,
            saved,
            error: None,
            staged: Vec::new(),
        }
    }

    pub fn failed(saved: bool, error: impl Into<String>) -> Self {
        Self {
            confirmed: false,
            saved,
            error: Some(error.into()),
            staged: Vec::new(),
        }
    }

    pub fn with_staged(mut self, staged: Vec<String>) -> Self {
        self.staged = staged;
        self
    }
}

#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send + 'static;

    fn decode(&self, payload: &[u8]) -> Result<Self::Payload, String> {
        serde_json::from_slice(payload).map_err(|e| e.to_string())
    }

    fn dedup_key(&self, payload: &Self::Payload) -> Option<String>;

    async fn process_with_delivery(
        &self,
        payload: Self::Payload,
        message_id: &str,
    ) -> anyhow::Result<DeliveryOutcome>;
}

const MESSAGE_ID_NAMESPACE: uuid::Uuid = uuid::Uuid::from_u128(0x6d1f_3c0a_9b7e_4f52_a1c8_2e4d_5b90_7f13);

/// `msg_<32 hex>`, random.
pub fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

/// `msg_<32 hex>`, the same for every call with the same dedup key.
pub fn stable_message_id(dedup_key: &str) -> String {
    format!(
        "msg_{}",
        uuid::Uuid::new_v5(&MESSAGE_ID_NAMESPACE, dedup_key.as_bytes()).simple()
    )
}

/// Per-recipient id derived from the attempt's base id.
pub fn recipient_message_id(base: &str, user_id: &str) -> String {
    format!("{}_{}", base, user_id)
}

/// Adapts a [`DeliveryHandler`] to the [`Processor`] interface.
pub struct DeliveryAware<H> {
    handler: H,
    store: Arc<dyn PendingDeliveryStore>,
}

impl<H: DeliveryHandler> DeliveryAware<H> {
    pub fn new(handler: H, store: Arc<dyn PendingDeliveryStore>) -> Self {
        Self { handler, store }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

#[async_trait]
impl<H: DeliveryHandler> Processor for DeliveryAware<H> {
    type Payload = H::Payload;

    fn decode(&self, payload: &[u8]) -> Result<Self::Payload, String> {
        self.handler.decode(payload)
    }

    fn dedup_key(&self, payload: &Self::Payload) -> Option<String> {
        self.handler.dedup_key(payload)
    }

    async fn process(&self, payload: Self::Payload) -> anyhow::Result<()> {
        // Keyless jobs opt out of idempotency and get a fresh id per attempt.
        let message_id = match self.handler.dedup_key(&payload) {
            Some(key) => stable_message_id(&key),
            None => new_message_id(),
        };
        let outcome = self
            .handler
            .process_with_delivery(payload, &message_id)
            .await?;

        if !outcome.confirmed {
            anyhow::bail!(
                "delivery {} not confirmed: {}",
                message_id,
                outcome.error.as_deref().unwrap_or("no error reported")
            );
        }

        for recipient_id in &outcome.staged {
            if let Err(e) = self.store.remove_pending_delivery(recipient_id).await {
                tracing::warn!(message_id = %recipient_id, error = %e, "Failed to clear pending delivery");
            }
        }

        tracing::debug!(message_id = %message_id, saved = outcome.saved, "Delivery confirmed");
        Ok(())
    }
}

/// Polling cadence for confirmation waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
}

impl From<&DeliveryConfig> for WaitPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            timeout: config.confirmation_timeout,
            poll_interval: config.poll_interval,
            max_poll_interval: config.max_poll_interval.max(config.poll_interval),
        }
    }
}

/// Terminal state of one watched message.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Acknowledged by the client; carries the record as staged.
    Confirmed(PendingDeliveryRecord),
    /// Gone without acknowledgement: expired, or failed on the client.
    Vanished,
    /// Still staged when the deadline passed.
    TimedOut,
}

/// Watches staged messages until each settles. Yields settlements as they happen.
pub struct ConfirmationWait {
    store: Arc<dyn PendingDeliveryStore>,
    policy: WaitPolicy,
    outstanding: Vec<String>,
    ready: VecDeque<(String, Settlement)>,
    deadline: Instant,
    interval: Duration,
}

impl ConfirmationWait {
    pub fn new(
        store: Arc<dyn PendingDeliveryStore>,
        policy: WaitPolicy,
        message_ids: Vec<String>,
    ) -> Self {
        Self {
            store,
            policy,
            outstanding: message_ids,
            ready: VecDeque::new(),
            deadline: Instant::now() + policy.timeout,
            interval: policy.poll_interval,
        }
    }

    /// Number of messages not yet settled.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len() + self.ready.len()
    }

    /// The next settlement, or `None` once every message has settled.
    ///
    /// Store errors while polling count as "still pending"; a message whose state
    /// cannot be read settles as [`Settlement::TimedOut`] at the deadline.
    pub async fn next(&mut self) -> Option<(String, Settlement)> {
        loop {
            if let Some(settled) = self.ready.pop_front() {
                return Some(settled);
            }
            if self.outstanding.is_empty() {
                return None;
            }

            self.poll().await;
            if !self.ready.is_empty() {
                self.interval = self.policy.poll_interval;
                continue;
            }

            let now = Instant::now();
            if now >= self.deadline {
                for message_id in self.outstanding.drain(..) {
                    self.ready.push_back((message_id, Settlement::TimedOut));
                }
                continue;
            }

            let pause = self.interval.min(self.deadline - now);
            self.store.wait_for_change(pause).await;
            self.interval = (self.interval * 2).min(self.policy.max_poll_interval);
        }
    }

    async fn poll(&mut self) {
        let mut still_pending = Vec::with_capacity(self.outstanding.len());

        for message_id in std::mem::take(&mut self.outstanding) {
            // Cheap existence check first; only a transition needs the claim.
            match self.store.is_pending(&message_id).await {
                Ok(true) => {
                    still_pending.push(message_id);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(message_id = %message_id, error = %e, "Pending check failed");
                    still_pending.push(message_id);
                    continue;
                }
            }

            match self.store.claim_resolution(&message_id).await {
                Ok(Resolution::Pending) => still_pending.push(message_id),
                Ok(Resolution::Confirmed(record)) => {
                    self.ready
                        .push_back((message_id, Settlement::Confirmed(record)));
                }
                Ok(Resolution::Absent) => {
                    self.ready.push_back((message_id, Settlement::Vanished));
                }
                Err(e) => {
                    tracing::warn!(message_id = %message_id, error = %e, "Confirmation claim failed");
                    still_pending.push(message_id);
                }
            }
        }

        self.outstanding = still_pending;
    }
}
