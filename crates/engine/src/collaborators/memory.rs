//! In-memory collaborators for tests and local runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use herald_common::types::{NotificationKind, NotificationRecord};

use super::{MembershipDirectory, NotificationSink, PreferenceLookup, RecipientDirectory};

#[derive(Debug, Default)]
struct Inner {
    persisted: Vec<NotificationRecord>,
    muted: HashSet<(String, NotificationKind)>,
    emails: HashMap<String, String>,
    friendships: HashMap<String, (String, String)>,
    memberships: HashMap<String, Vec<String>>,
    fail_once: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryCollaborators {
    inner: Mutex<Inner>,
    fail_persist: AtomicBool,
}

impl MemoryCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn off live delivery of `kind` for `user_id`.
    pub fn mute(&self, user_id: &str, kind: NotificationKind) {
        self.lock().muted.insert((user_id.to_string(), kind));
    }

    pub fn add_user(&self, user_id: &str, email: &str) {
        self.lock()
            .emails
            .insert(email.to_ascii_lowercase(), user_id.to_string());
    }

    pub fn add_friendship(&self, friendship_id: &str, requester: &str, addressee: &str) {
        self.lock().friendships.insert(
            friendship_id.to_string(),
            (requester.to_string(), addressee.to_string()),
        );
    }

    pub fn add_membership(&self, user_id: &str, tenant_id: &str) {
        self.lock()
            .memberships
            .entry(user_id.to_string())
            .or_default()
            .push(tenant_id.to_string());
    }

    /// Make every `persist` call fail until switched back.
    pub fn set_fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    /// Make the next `persist` call for `user_id` fail.
    pub fn fail_next_persist_for(&self, user_id: &str) {
        self.lock().fail_once.insert(user_id.to_string());
    }

    pub fn persisted(&self) -> Vec<NotificationRecord> {
        self.lock().persisted.clone()
    }

    pub fn persisted_for(&self, user_id: &str) -> Vec<NotificationRecord> {
        self.lock()
            .persisted
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl NotificationSink for MemoryCollaborators {
    async fn persist(&self, record: &NotificationRecord) -> anyhow::Result<()> {
        if self.fail_persist.load(Ordering::SeqCst) {
            anyhow::bail!("notification sink unavailable");
        }
        let mut inner = self.lock();
        if inner.fail_once.remove(&record.user_id) {
            anyhow::bail!("notification sink rejected {}", record.message_id);
        }
        if !inner
            .persisted
            .iter()
            .any(|r| r.message_id == record.message_id)
        {
            inner.persisted.push(record.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl PreferenceLookup for MemoryCollaborators {
    async fn live_delivery_enabled(&self, user_id: &str, kind: NotificationKind) -> anyhow::Result<bool> {
        Ok(!self.lock().muted.contains(&(user_id.to_string(), kind)))
    }
}

#[async_trait]
impl RecipientDirectory for MemoryCollaborators {
    async fn user_id_by_email(&self, email: &str) -> anyhow::Result<Option<String>> {
        Ok(self.lock().emails.get(&email.to_ascii_lowercase()).cloned())
    }

    async fn friendship_counterpart(
        &self,
        friendship_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<String>> {
        Ok(self
            .lock()
            .friendships
            .get(friendship_id)
            .and_then(|(requester, addressee)| {
                if requester == user_id {
                    Some(addressee.clone())
                } else if addressee == user_id {
                    Some(requester.clone())
                } else {
                    None
                }
            }))
    }
}

#[async_trait]
impl MembershipDirectory for MemoryCollaborators {
    async fn tenants_of(&self, user_id: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .lock()
            .memberships
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_friendship_counterpart_from_either_side() {
        let directory = MemoryCollaborators::new();
        directory.add_friendship("f1", "u1", "u2");

        assert_eq!(
            directory.friendship_counterpart("f1", "u1").await.unwrap(),
            Some("u2".to_string())
        );
        assert_eq!(
            directory.friendship_counterpart("f1", "u2").await.unwrap(),
            Some("u1".to_string())
        );
        assert_eq!(directory.friendship_counterpart("f1", "u3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_email_lookup_ignores_case() {
        let directory = MemoryCollaborators::new();
        directory.add_user("u1", "Ada@Example.com");
        assert_eq!(
            directory.user_id_by_email("ada@example.COM").await.unwrap(),
            Some("u1".to_string())
        );
    }
}
