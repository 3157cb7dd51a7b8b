//! Recipient resolution for notification jobs.
//!
//! Strategies are tried in order and the first one that yields anybody wins:
//! 1. explicit `recipients`
//! 2. `receiver.id`
//! 3. `userId`
//! 4. `receiver.email` looked up in the directory
//! 5. the counterpart of `friendshipId` as seen from `senderId`

use herald_common::types::NotificationJob;
use herald_engine::collaborators::RecipientDirectory;

pub async fn resolve_recipients(
    job: &NotificationJob,
    directory: &dyn RecipientDirectory,
) -> anyhow::Result<Vec<String>> {
    if !job.recipients.is_empty() {
        let mut unique: Vec<String> = Vec::with_capacity(job.recipients.len());
        for id in &job.recipients {
            if !unique.contains(id) {
                unique.push(id.clone());
            }
        }
        return Ok(unique);
    }

    if let Some(id) = job.receiver.as_ref().and_then(|r| r.id.as_ref()) {
        return Ok(vec![id.clone()]);
    }

    if let Some(id) = &job.user_id {
        return Ok(vec![id.clone()]);
    }

    if let Some(email) = job.receiver.as_ref().and_then(|r| r.email.as_ref()) {
        match directory.user_id_by_email(email).await? {
            Some(id) => return Ok(vec![id]),
            None => tracing::debug!(event_id = %job.event_id, "No user registered for receiver email"),
        }
    }

    if let (Some(friendship_id), Some(sender_id)) = (&job.friendship_id, &job.sender_id)
        && let Some(id) = directory
            .friendship_counterpart(friendship_id, sender_id)
            .await?
    {
        return Ok(vec![id]);
    }

    Ok(Vec::new())
}
