//! Domain event bridge.
//!
//! Fans each domain event out to up to two destinations:
//! 1. the durable path: a [`NotificationJob`] on `notifications.deliver` for events
//!    that notify a person
//! 2. the gateway: the matching realtime broadcast to a tenant or user room
//!
//! The job is published first. A failed publish fails the message so the consumer
//! retries it; a failed broadcast is logged and dropped, since broadcasts are
//! best-effort UI hints.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use herald_common::types::{
    DomainEvent, DomainEventEnvelope, NotificationJob, NotificationKind, Room, events, queues,
};

use crate::broker::{Broker, QueueMessage};
use crate::consumer::Processor;
use crate::fanout::{EmitOutcome, RealtimeEmitter};

/// What the bridge did with one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeReport {
    pub job_published: bool,
    pub broadcast_sent: bool,
}

pub struct EventBridge {
    broker: Arc<dyn Broker>,
    emitter: Arc<dyn RealtimeEmitter>,
    notification_queue: String,
}

impl EventBridge {
    pub fn new(broker: Arc<dyn Broker>, emitter: Arc<dyn RealtimeEmitter>) -> Self {
        Self {
            broker,
            emitter,
            notification_queue: queues::NOTIFICATIONS_DELIVER.to_string(),
        }
    }

    pub fn with_notification_queue(mut self, queue: impl Into<String>) -> Self {
        self.notification_queue = queue.into();
        self
    }

    pub async fn dispatch(&self, envelope: &DomainEventEnvelope) -> anyhow::Result<BridgeReport> {
        let mut report = BridgeReport::default();

        if let Some(job) = notification_for(envelope) {
            self.broker
                .publish(&self.notification_queue, QueueMessage::json(&job)?)
                .await?;
            report.job_published = true;
        }

        if let Some((room, event, payload)) = broadcast_for(&envelope.event) {
            match self.emitter.emit(&room, event, payload).await {
                Ok(EmitOutcome::Sent) => report.broadcast_sent = true,
                Ok(EmitOutcome::RateLimited) => {}
                Err(e) => tracing::warn!(
                    event_id = %envelope.id,
                    room = %room,
                    event,
                    error = %e,
                    "Broadcast failed"
                ),
            }
        }

        tracing::debug!(
            event_id = %envelope.id,
            job_published = report.job_published,
            broadcast_sent = report.broadcast_sent,
            "Domain event bridged"
        );
        Ok(report)
    }
}

#[async_trait]
impl Processor for EventBridge {
    type Payload = DomainEventEnvelope;

    fn dedup_key(&self, envelope: &DomainEventEnvelope) -> Option<String> {
        Some(format!("domain:{}", envelope.id))
    }

    async fn process(&self, envelope: DomainEventEnvelope) -> anyhow::Result<()> {
        self.dispatch(&envelope).await.map(|_| ())
    }
}

/// Realtime broadcast for `event`: target room, event name and payload.
pub fn broadcast_for(event: &DomainEvent) -> Option<(Room, &'static str, serde_json::Value)> {
    match event {
        DomainEvent::MemberJoined { tenant_id, user_id } => Some((
            Room::tenant(tenant_id),
            events::MEMBER_JOINED,
            json!({ "tenantId": tenant_id, "userId": user_id }),
        )),
        DomainEvent::MemberLeft { tenant_id, user_id } => Some((
            Room::tenant(tenant_id),
            events::MEMBER_LEFT,
            json!({ "tenantId": tenant_id, "userId": user_id }),
        )),
        DomainEvent::CompanyUpdated { tenant_id, changes } => Some((
            Room::tenant(tenant_id),
            events::COMPANY_UPDATED,
            json!({ "tenantId": tenant_id, "changes": changes }),
        )),
        DomainEvent::InviteCreated { .. } => None,
        DomainEvent::InviteRejected {
            tenant_id,
            invite_id,
            inviter_id,
            receiver_id,
        } => Some((
            Room::user(inviter_id),
            events::INVITE_REJECTED,
            json!({ "tenantId": tenant_id, "inviteId": invite_id, "receiverId": receiver_id }),
        )),
        DomainEvent::FriendRequestSent {
            request_id,
            sender_id,
            receiver_id,
        } => Some((
            Room::user(receiver_id),
            events::FRIEND_REQUEST_SENT,
            json!({ "requestId": request_id, "senderId": sender_id }),
        )),
        DomainEvent::FriendRequestAccepted {
            request_id,
            sender_id,
            receiver_id,
        } => Some((
            Room::user(sender_id),
            events::FRIEND_REQUEST_ACCEPTED,
            json!({ "requestId": request_id, "receiverId": receiver_id }),
        )),
        DomainEvent::FriendRequestRejected {
            request_id,
            sender_id,
            receiver_id,
        } => Some((
            Room::user(sender_id),
            events::FRIEND_REQUEST_REJECTED,
            json!({ "requestId": request_id, "receiverId": receiver_id }),
        )),
    }
}

/// Durable notification job for the envelope's event, if it notifies a person.
/// Jobs without a natural identity are keyed by the envelope id.
pub fn notification_for(envelope: &DomainEventEnvelope) -> Option<NotificationJob> {
    let mut job = job_for(&envelope.event)?;
    if job.dedup_key().is_none() {
        // One job per domain event: a redelivered event must not notify twice.
        job.dedup_key = Some(format!("domain:{}:{}", envelope.id, job.event_id.as_str()));
    }
    Some(job)
}

fn job_for(event: &DomainEvent) -> Option<NotificationJob> {
    match event {
        DomainEvent::MemberJoined { tenant_id, user_id } => {
            let mut job = NotificationJob::new(NotificationKind::MemberJoined);
            job.user_id = Some(user_id.clone());
            job.tenant_id = Some(tenant_id.clone());
            Some(job)
        }
        DomainEvent::MemberLeft { tenant_id, user_id } => {
            let mut job = NotificationJob::new(NotificationKind::MemberLeft);
            job.user_id = Some(user_id.clone());
            job.tenant_id = Some(tenant_id.clone());
            Some(job)
        }
        DomainEvent::CompanyUpdated { .. } => None,
        DomainEvent::InviteCreated {
            tenant_id,
            invite_id,
            receiver,
            inviter_id,
        } => {
            let mut job = NotificationJob::new(NotificationKind::InviteCreated);
            job.receiver = Some(receiver.clone());
            job.tenant_id = Some(tenant_id.clone());
            job.invite_id = Some(invite_id.clone());
            job.sender_id = inviter_id.clone();
            Some(job)
        }
        DomainEvent::InviteRejected {
            tenant_id,
            invite_id,
            inviter_id,
            ..
        } => {
            let mut job = NotificationJob::new(NotificationKind::InviteRejected);
            job.user_id = Some(inviter_id.clone());
            job.tenant_id = Some(tenant_id.clone());
            job.invite_id = Some(invite_id.clone());
            Some(job)
        }
        DomainEvent::FriendRequestSent {
            request_id,
            sender_id,
            receiver_id,
        } => {
            let mut job = NotificationJob::new(NotificationKind::FriendRequestSent);
            job.user_id = Some(receiver_id.clone());
            job.sender_id = Some(sender_id.clone());
            job.request_id = Some(request_id.clone());
            Some(job)
        }
        DomainEvent::FriendRequestAccepted {
            request_id,
            sender_id,
            receiver_id,
        } => {
            let mut job = NotificationJob::new(NotificationKind::FriendRequestAccepted);
            job.user_id = Some(sender_id.clone());
            job.sender_id = Some(receiver_id.clone());
            job.request_id = Some(request_id.clone());
            Some(job)
        }
        DomainEvent::FriendRequestRejected { .. } => None,
    }
}
