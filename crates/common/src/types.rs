use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Realtime event names shared by the gateway and the workers.
pub mod events {
    pub const NOTIFICATION_CREATED: &str = "notification.created";
    pub const NOTIFICATION_DELIVERED: &str = "notification.delivered";
    pub const NOTIFICATION_DELIVERY_FAILED: &str = "notification.delivery.failed";
    pub const MEMBER_JOINED: &str = "member.joined";
    pub const MEMBER_LEFT: &str = "member.left";
    pub const COMPANY_UPDATED: &str = "company.updated";
    pub const INVITE_REJECTED: &str = "invite.rejected";
    pub const FRIEND_REQUEST_SENT: &str = "friend_request.sent";
    pub const FRIEND_REQUEST_ACCEPTED: &str = "friend_request.accepted";
    pub const FRIEND_REQUEST_REJECTED: &str = "friend_request.rejected";
}

/// Queue names. Dead-letter queues are derived with [`dead_letter_queue`].
pub mod queues {
    pub const NOTIFICATIONS_DELIVER: &str = "notifications.deliver";
    pub const EVENTS_DOMAIN: &str = "events.domain";

    /// `{domain}.{action}` → `dlq.{domain}.{action}`
    pub fn dead_letter_queue(queue: &str) -> String {
        format!("dlq.{}", queue)
    }
}

/// An addressable broadcast group on the realtime gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Room {
    User(String),
    Tenant(String),
    /// Every connected socket.
    Broadcast,
}

impl Room {
    pub fn user(id: impl Into<String>) -> Self {
        Room::User(id.into())
    }

    pub fn tenant(id: impl Into<String>) -> Self {
        Room::Tenant(id.into())
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::User(id) => write!(f, "user:{}", id),
            Room::Tenant(id) => write!(f, "tenant:{}", id),
            Room::Broadcast => write!(f, "*"),
        }
    }
}

impl FromStr for Room {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Room::Broadcast);
        }
        match s.split_once(':') {
            Some(("user", id)) if !id.is_empty() => Ok(Room::User(id.to_string())),
            Some(("tenant", id)) if !id.is_empty() => Ok(Room::Tenant(id.to_string())),
            _ => Err(format!("invalid room '{}'", s)),
        }
    }
}

impl TryFrom<String> for Room {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Room> for String {
    fn from(room: Room) -> Self {
        room.to_string()
    }
}

/// A frame exchanged over the realtime connection, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Where a pending delivery is headed and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryMetadata {
    pub target_user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub created_at_millis: i64,
    pub source_queue: String,
}

/// A staged notification awaiting client acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDeliveryRecord {
    pub message_id: String,
    pub payload: serde_json::Value,
    pub metadata: DeliveryMetadata,
}

/// Notification kinds carried in the `eventId` discriminator of a notification job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    InviteCreated,
    InviteAccepted,
    InviteRejected,
    MemberJoined,
    MemberLeft,
    CompanyUpdated,
    FriendRequestSent,
    FriendRequestAccepted,
    FriendRequestRejected,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::InviteCreated => "INVITE_CREATED",
            NotificationKind::InviteAccepted => "INVITE_ACCEPTED",
            NotificationKind::InviteRejected => "INVITE_REJECTED",
            NotificationKind::MemberJoined => "MEMBER_JOINED",
            NotificationKind::MemberLeft => "MEMBER_LEFT",
            NotificationKind::CompanyUpdated => "COMPANY_UPDATED",
            NotificationKind::FriendRequestSent => "FRIEND_REQUEST_SENT",
            NotificationKind::FriendRequestAccepted => "FRIEND_REQUEST_ACCEPTED",
            NotificationKind::FriendRequestRejected => "FRIEND_REQUEST_REJECTED",
        }
    }

    /// Default title used when the producer does not supply one.
    pub fn default_title(&self) -> &'static str {
        match self {
            NotificationKind::InviteCreated => "New company invitation",
            NotificationKind::InviteAccepted => "Invitation accepted",
            NotificationKind::InviteRejected => "Invitation declined",
            NotificationKind::MemberJoined => "New member",
            NotificationKind::MemberLeft => "Member left",
            NotificationKind::CompanyUpdated => "Company updated",
            NotificationKind::FriendRequestSent => "New friend request",
            NotificationKind::FriendRequestAccepted => "Friend request accepted",
            NotificationKind::FriendRequestRejected => "Friend request declined",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a person by id, email, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartyRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Payload of the `notifications.deliver` queue.
///
/// Recipient sources are tried in field order by the delivery handler; at least one
/// must be present for the job to be valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationJob {
    pub event_id: NotificationKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<PartyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendship_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Remaining producer fields, forwarded to the client untouched.
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl NotificationJob {
    pub fn new(event_id: NotificationKind) -> Self {
        Self {
            event_id,
            recipients: Vec::new(),
            receiver: None,
            user_id: None,
            friendship_id: None,
            sender_id: None,
            tenant_id: None,
            invite_id: None,
            request_id: None,
            dedup_key: None,
            title: None,
            body: None,
            data: serde_json::Map::new(),
        }
    }

    /// Boundary validation run before the job reaches business logic.
    pub fn validate(&self) -> Result<(), String> {
        let receiver_usable = self
            .receiver
            .as_ref()
            .is_some_and(|r| r.id.is_some() || r.email.is_some());
        let counterpart_usable = self.friendship_id.is_some() && self.sender_id.is_some();

        if self.recipients.is_empty()
            && !receiver_usable
            && self.user_id.is_none()
            && !counterpart_usable
        {
            return Err(format!("{} job has no recipient source", self.event_id));
        }
        if self.recipients.iter().any(|r| r.trim().is_empty()) {
            return Err("recipients must not contain empty ids".to_string());
        }
        Ok(())
    }

    /// Key identifying this logical notification across redeliveries.
    pub fn dedup_key(&self) -> Option<String> {
        if let Some(key) = &self.dedup_key {
            return Some(key.clone());
        }
        if let Some(invite_id) = &self.invite_id {
            return Some(format!("evt:{}:invite:{}", self.event_id, invite_id));
        }
        let request_id = self.request_id.as_ref()?;
        let subject = self
            .user_id
            .as_ref()
            .or(self.recipients.first())
            .or(self.receiver.as_ref().and_then(|r| r.id.as_ref()))
            .or(self.sender_id.as_ref())?;
        Some(format!("{}:{}:{}", self.event_id, subject, request_id))
    }

    pub fn title(&self) -> String {
        self.title
            .clone()
            .unwrap_or_else(|| self.event_id.default_title().to_string())
    }
}

/// A domain event emitted by the business layer, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum DomainEvent {
    #[serde(rename = "member.joined")]
    MemberJoined { tenant_id: String, user_id: String },
    #[serde(rename = "member.left")]
    MemberLeft { tenant_id: String, user_id: String },
    #[serde(rename = "company.updated")]
    CompanyUpdated {
        tenant_id: String,
        #[serde(default)]
        changes: serde_json::Value,
    },
    #[serde(rename = "invite.created")]
    InviteCreated {
        tenant_id: String,
        invite_id: String,
        receiver: PartyRef,
        #[serde(default)]
        inviter_id: Option<String>,
    },
    #[serde(rename = "invite.rejected")]
    InviteRejected {
        tenant_id: String,
        invite_id: String,
        inviter_id: String,
        #[serde(default)]
        receiver_id: Option<String>,
    },
    #[serde(rename = "friend_request.sent")]
    FriendRequestSent {
        request_id: String,
        sender_id: String,
        receiver_id: String,
    },
    #[serde(rename = "friend_request.accepted")]
    FriendRequestAccepted {
        request_id: String,
        sender_id: String,
        receiver_id: String,
    },
    #[serde(rename = "friend_request.rejected")]
    FriendRequestRejected {
        request_id: String,
        sender_id: String,
        receiver_id: String,
    },
}

/// Payload of the `events.domain` queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEventEnvelope {
    pub id: String,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DomainEvent,
}

/// A notification row handed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: Uuid,
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub kind: NotificationKind,
    pub title: String,
    pub body: Option<String>,
    pub data: serde_json::Value,
    /// Per-recipient message id; unique, so a repeated insert is a no-op.
    pub message_id: String,
    /// Whether the client confirmed the live push before persistence.
    pub delivered_live: bool,
    pub created_at: DateTime<Utc>,
}
