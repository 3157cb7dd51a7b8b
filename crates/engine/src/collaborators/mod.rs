//! Ports to the systems around the delivery pipeline: notification persistence,
//! user preferences and the user/membership directories.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use herald_common::types::{NotificationKind, NotificationRecord};

pub use self::memory::MemoryCollaborators;
pub use self::postgres::PgCollaborators;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Persist `record`. Idempotent on `record.message_id`.
    async fn persist(&self, record: &NotificationRecord) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PreferenceLookup: Send + Sync {
    /// Whether `user_id` wants `kind` pushed live. Defaults to `true` when unset.
    async fn live_delivery_enabled(&self, user_id: &str, kind: NotificationKind) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn user_id_by_email(&self, email: &str) -> anyhow::Result<Option<String>>;

    /// The other party of `friendship_id`, seen from `user_id`.
    async fn friendship_counterpart(
        &self,
        friendship_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<String>>;
}

#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    /// Tenants `user_id` belongs to; used to join tenant rooms on connect.
    async fn tenants_of(&self, user_id: &str) -> anyhow::Result<Vec<String>>;
}
