//! Confirmed delivery of notification jobs.
//!
//! Per job:
//! 1. resolve recipients
//! 2. split them by live-delivery preference
//! 3. stage a pending record for every live recipient (a store failure aborts the
//!    attempt before anything was pushed or persisted)
//! 4. persist the bypassed recipients
//! 5. push `notification.created` to each live recipient's room
//! 6. wait for confirmations, persisting each recipient as it settles; anything
//!    unconfirmed at the deadline is persisted as a fallback
//!
//! Every recipient ends up persisted exactly once per attempt. Only a persistence
//! failure makes the attempt unconfirmed. Recipient ids are derived from the base
//! id, which stays stable across retries of a keyed job, so the sink's
//! idempotency on message id keeps a retry from persisting anyone twice.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use herald_common::config::DeliveryConfig;
use herald_common::types::{
    DeliveryMetadata, NotificationJob, NotificationKind, NotificationRecord, Room, events, queues,
};
use herald_engine::collaborators::{NotificationSink, PreferenceLookup, RecipientDirectory};
use herald_engine::delivery::{
    ConfirmationWait, DeliveryHandler, DeliveryOutcome, Settlement, WaitPolicy,
    recipient_message_id,
};
use herald_engine::fanout::{EmitOutcome, RealtimeEmitter};
use herald_engine::store::PendingDeliveryStore;

use crate::recipients::resolve_recipients;

/// External systems the handler talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub sink: Arc<dyn NotificationSink>,
    pub preferences: Arc<dyn PreferenceLookup>,
    pub directory: Arc<dyn RecipientDirectory>,
}

impl Collaborators {
    /// All three ports served by one value, e.g. a shared database handle.
    pub fn from_shared<T>(shared: Arc<T>) -> Self
    where
        T: NotificationSink + PreferenceLookup + RecipientDirectory + 'static,
    {
        Self {
            sink: shared.clone(),
            preferences: shared.clone(),
            directory: shared,
        }
    }
}

pub struct NotificationDelivery {
    store: Arc<dyn PendingDeliveryStore>,
    emitter: Arc<dyn RealtimeEmitter>,
    collaborators: Collaborators,
    config: DeliveryConfig,
    source_queue: String,
}

/// A recipient staged for live delivery.
struct Staged {
    user_id: String,
    payload: Value,
}

#[derive(Default)]
struct Tally {
    persisted: usize,
    failures: Vec<String>,
}

impl Tally {
    fn outcome(self) -> DeliveryOutcome {
        let saved = self.persisted > 0;
        if self.failures.is_empty() {
            DeliveryOutcome::confirmed(saved)
        } else {
            DeliveryOutcome::failed(saved, self.failures.join("; "))
        }
    }
}

impl NotificationDelivery {
    pub fn new(
        store: Arc<dyn PendingDeliveryStore>,
        emitter: Arc<dyn RealtimeEmitter>,
        collaborators: Collaborators,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            store,
            emitter,
            collaborators,
            config,
            source_queue: queues::NOTIFICATIONS_DELIVER.to_string(),
        }
    }

    async fn live_enabled(&self, user_id: &str, kind: NotificationKind) -> bool {
        match self
            .collaborators
            .preferences
            .live_delivery_enabled(user_id, kind)
            .await
        {
            Ok(enabled) => enabled,
            Err(e) => {
                tracing::warn!(
                    user_id,
                    kind = %kind,
                    error = %e,
                    "Preference lookup failed, defaulting to live delivery"
                );
                true
            }
        }
    }

    /// Best-effort removal of records staged by an attempt that is being abandoned.
    async fn discard(&self, staged: &HashMap<String, Staged>) {
        for recipient_id in staged.keys() {
            if let Err(e) = self.store.remove_pending_delivery(recipient_id).await {
                tracing::warn!(message_id = %recipient_id, error = %e, "Failed to discard staged delivery");
            }
        }
    }

    async fn persist(
        &self,
        job: &NotificationJob,
        user_id: &str,
        recipient_id: &str,
        payload: Value,
        delivered_live: bool,
        tally: &mut Tally,
    ) {
        let record = notification_record(job, user_id, recipient_id, payload, delivered_live);
        match self.collaborators.sink.persist(&record).await {
            Ok(()) => tally.persisted += 1,
            Err(e) => {
                tracing::error!(
                    message_id = %recipient_id,
                    user_id,
                    error = %e,
                    "Failed to persist notification"
                );
                tally.failures.push(format!("{}: {:#}", recipient_id, e));
            }
        }
    }

    /// Persist a live recipient that will not be confirmed and drop its staged record.
    async fn fall_back(
        &self,
        job: &NotificationJob,
        recipient_id: &str,
        staged: Staged,
        tally: &mut Tally,
    ) {
        self.persist(job, &staged.user_id, recipient_id, staged.payload, false, tally)
            .await;
        if let Err(e) = self.store.remove_pending_delivery(recipient_id).await {
            tracing::warn!(message_id = %recipient_id, error = %e, "Failed to remove pending delivery");
        }
    }
}

#[async_trait]
impl DeliveryHandler for NotificationDelivery {
    type Payload = NotificationJob;

    fn decode(&self, payload: &[u8]) -> Result<NotificationJob, String> {
        let job: NotificationJob = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
        job.validate()?;
        Ok(job)
    }

    fn dedup_key(&self, job: &NotificationJob) -> Option<String> {
        job.dedup_key()
    }

    async fn process_with_delivery(
        &self,
        job: NotificationJob,
        message_id: &str,
    ) -> anyhow::Result<DeliveryOutcome> {
        let recipients =
            resolve_recipients(&job, self.collaborators.directory.as_ref()).await?;
        if recipients.is_empty() {
            tracing::warn!(
                event_id = %job.event_id,
                message_id,
                "No recipient could be resolved, nothing to deliver"
            );
            return Ok(DeliveryOutcome::confirmed(false));
        }

        let mut live = Vec::new();
        let mut bypassed = Vec::new();
        for user_id in recipients {
            if self.live_enabled(&user_id, job.event_id).await {
                live.push(user_id);
            } else {
                bypassed.push(user_id);
            }
        }

        let mut staged: HashMap<String, Staged> = HashMap::with_capacity(live.len());
        let mut push_order = Vec::with_capacity(live.len());
        for user_id in live {
            let recipient_id = recipient_message_id(message_id, &user_id);
            let payload = client_payload(&job, &recipient_id)?;
            let metadata = DeliveryMetadata {
                target_user_id: user_id.clone(),
                tenant_id: job.tenant_id.clone(),
                created_at_millis: Utc::now().timestamp_millis(),
                source_queue: self.source_queue.clone(),
            };

            if let Err(e) = self
                .store
                .store_pending_delivery(
                    &recipient_id,
                    payload.clone(),
                    metadata,
                    self.config.confirmation_ttl,
                )
                .await
            {
                self.discard(&staged).await;
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to stage delivery {}", recipient_id)));
            }

            push_order.push(recipient_id.clone());
            staged.insert(recipient_id, Staged { user_id, payload });
        }

        let staged_ids = push_order.clone();
        let mut tally = Tally::default();

        for user_id in &bypassed {
            let recipient_id = recipient_message_id(message_id, user_id);
            tracing::debug!(
                message_id = %recipient_id,
                user_id = %user_id,
                "Live delivery disabled, persisting directly"
            );
            let payload = client_payload(&job, &recipient_id)?;
            self.persist(&job, user_id, &recipient_id, payload, false, &mut tally)
                .await;
        }

        let mut awaiting = Vec::with_capacity(push_order.len());
        for recipient_id in push_order {
            let Some(entry) = staged.get(&recipient_id) else {
                continue;
            };
            let room = Room::user(&entry.user_id);

            match self
                .emitter
                .emit(&room, events::NOTIFICATION_CREATED, entry.payload.clone())
                .await
            {
                Ok(EmitOutcome::Sent) => awaiting.push(recipient_id),
                Ok(EmitOutcome::RateLimited) => {
                    tracing::warn!(message_id = %recipient_id, room = %room, "Push rate limited, persisting without confirmation");
                    if let Some(entry) = staged.remove(&recipient_id) {
                        self.fall_back(&job, &recipient_id, entry, &mut tally).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(message_id = %recipient_id, room = %room, error = %e, "Push failed, persisting without confirmation");
                    if let Some(entry) = staged.remove(&recipient_id) {
                        self.fall_back(&job, &recipient_id, entry, &mut tally).await;
                    }
                }
            }
        }

        let mut wait = ConfirmationWait::new(
            self.store.clone(),
            WaitPolicy::from(&self.config),
            awaiting,
        );
        while let Some((recipient_id, settlement)) = wait.next().await {
            let Some(entry) = staged.remove(&recipient_id) else {
                continue;
            };

            match settlement {
                Settlement::Confirmed(record) => {
                    tracing::debug!(message_id = %recipient_id, "Delivery confirmed by client");
                    self.persist(
                        &job,
                        &entry.user_id,
                        &recipient_id,
                        record.payload,
                        true,
                        &mut tally,
                    )
                    .await;
                }
                Settlement::Vanished => {
                    tracing::warn!(
                        message_id = %recipient_id,
                        "Pending delivery gone without confirmation, persisting"
                    );
                    self.persist(
                        &job,
                        &entry.user_id,
                        &recipient_id,
                        entry.payload,
                        false,
                        &mut tally,
                    )
                    .await;
                }
                Settlement::TimedOut => {
                    tracing::warn!(
                        message_id = %recipient_id,
                        timeout_ms = self.config.confirmation_timeout.as_millis() as u64,
                        "Confirmation timed out, persisting"
                    );
                    self.fall_back(&job, &recipient_id, entry, &mut tally).await;
                }
            }
        }

        Ok(tally.outcome().with_staged(staged_ids))
    }
}

/// The JSON pushed to the client: the job's fields plus `messageId` and a resolved `title`.
fn client_payload(job: &NotificationJob, recipient_id: &str) -> serde_json::Result<Value> {
    let mut payload = serde_json::to_value(job)?;
    if let Value::Object(map) = &mut payload {
        map.insert("messageId".to_string(), Value::String(recipient_id.to_string()));
        map.insert("title".to_string(), Value::String(job.title()));
    }
    Ok(payload)
}

fn notification_record(
    job: &NotificationJob,
    user_id: &str,
    recipient_id: &str,
    payload: Value,
    delivered_live: bool,
) -> NotificationRecord {
    let title = payload
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| job.title());
    let body = payload
        .get("body")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| job.body.clone());

    NotificationRecord {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        tenant_id: job.tenant_id.clone(),
        kind: job.event_id,
        title,
        body,
        data: payload,
        message_id: recipient_id.to_string(),
        delivered_live,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_client_payload_injects_message_id() {
        let job: NotificationJob = serde_json::from_value(json!({
            "eventId": "INVITE_CREATED",
            "receiver": { "id": "u1" },
            "companyName": "Acme"
        }))
        .unwrap();

        let payload = client_payload(&job, "msg_abc_u1").unwrap();
        assert_eq!(payload["messageId"], json!("msg_abc_u1"));
        assert_eq!(payload["title"], json!("New company invitation"));
        assert_eq!(payload["companyName"], json!("Acme"));
        assert_eq!(payload["eventId"], json!("INVITE_CREATED"));
    }

    #[test]
    fn test_record_prefers_echoed_title() {
        let job = NotificationJob::new(NotificationKind::MemberJoined);
        let record = notification_record(
            &job,
            "u1",
            "msg_abc_u1",
            json!({ "title": "Welcome aboard", "body": "Say hi" }),
            true,
        );

        assert_eq!(record.title, "Welcome aboard");
        assert_eq!(record.body.as_deref(), Some("Say hi"));
        assert_eq!(record.kind, NotificationKind::MemberJoined);
        assert!(record.delivered_live);
    }

    #[test]
    fn test_decode_rejects_job_without_recipient() {
        let handler = NotificationDelivery::new(
            Arc::new(herald_engine::store::MemoryStore::new()),
            Arc::new(NullEmitter),
            Collaborators::from_shared(Arc::new(
                herald_engine::collaborators::MemoryCollaborators::new(),
            )),
            DeliveryConfig::default(),
        );

        assert!(handler.decode(br#"{"eventId":"COMPANY_UPDATED"}"#).is_err());
        assert!(handler.decode(br#"{"eventId":"NOPE","userId":"u1"}"#).is_err());
        assert!(handler.decode(br#"{"eventId":"MEMBER_LEFT","userId":"u1"}"#).is_ok());
    }

    struct NullEmitter;

    #[async_trait]
    impl RealtimeEmitter for NullEmitter {
        async fn emit(
            &self,
            _room: &Room,
            _event: &str,
            _payload: Value,
        ) -> Result<EmitOutcome, herald_engine::fanout::FanoutError> {
            Ok(EmitOutcome::Sent)
        }
    }
}
