//! Client-to-server frames on an authenticated connection.
//!
//! Only delivery acknowledgements are accepted. Nothing here is surfaced to the
//! client: bad frames and store errors are logged and the connection stays up.

use serde::Deserialize;

use herald_common::types::{RealtimeFrame, events};
use herald_engine::rate_limit::RateLimiter;
use herald_engine::store::PendingDeliveryStore;

const MESSAGE_ID_PREFIX: &str = "msg_";
const MAX_MESSAGE_ID_LEN: usize = 256;

/// What became of one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// The pending record moved to the confirmed slot.
    Confirmed,
    /// Nothing was pending under the id: already confirmed, expired or removed.
    AlreadyResolved,
    /// The client reported a failure; the pending record was dropped.
    FailureRecorded,
    RateLimited,
    Rejected(String),
    StoreError(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckData {
    message_id: String,
    #[serde(default)]
    error: Option<String>,
}

/// Handle one raw text frame from `user_id`.
pub async fn handle_frame(
    store: &dyn PendingDeliveryStore,
    limiter: &RateLimiter,
    user_id: &str,
    raw: &str,
) -> InboundOutcome {
    let frame: RealtimeFrame = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => return rejected(user_id, None, format!("malformed frame: {}", e)),
    };
    let event = frame.event.as_str();

    if event != events::NOTIFICATION_DELIVERED && event != events::NOTIFICATION_DELIVERY_FAILED {
        return rejected(user_id, Some(event), "unsupported event".to_string());
    }

    if !limiter.check(user_id, event).await.allowed {
        return InboundOutcome::RateLimited;
    }

    let ack: AckData = match serde_json::from_value(frame.data) {
        Ok(ack) => ack,
        Err(e) => return rejected(user_id, Some(event), format!("invalid payload: {}", e)),
    };

    if let Err(reason) = validate_message_id(&ack.message_id, user_id) {
        return rejected(user_id, Some(event), reason);
    }

    if event == events::NOTIFICATION_DELIVERED {
        match store.confirm_delivery(&ack.message_id).await {
            Ok(Some(_)) => {
                tracing::debug!(user_id, message_id = %ack.message_id, "Delivery confirmed");
                InboundOutcome::Confirmed
            }
            Ok(None) => {
                tracing::debug!(
                    user_id,
                    message_id = %ack.message_id,
                    "Confirmation for a delivery that is no longer pending"
                );
                InboundOutcome::AlreadyResolved
            }
            Err(e) => store_error(user_id, &ack.message_id, e.to_string()),
        }
    } else {
        tracing::warn!(
            user_id,
            message_id = %ack.message_id,
            error = ack.error.as_deref().unwrap_or("unspecified"),
            "Client reported delivery failure"
        );
        match store.remove_pending_delivery(&ack.message_id).await {
            Ok(()) => InboundOutcome::FailureRecorded,
            Err(e) => store_error(user_id, &ack.message_id, e.to_string()),
        }
    }
}

/// A client may only acknowledge its own messages: per-recipient ids end in `_{userId}`.
pub fn validate_message_id(message_id: &str, user_id: &str) -> Result<(), String> {
    if message_id.trim().is_empty() {
        return Err("messageId is empty".to_string());
    }
    if message_id.len() > MAX_MESSAGE_ID_LEN {
        return Err("messageId is too long".to_string());
    }
    if !message_id.starts_with(MESSAGE_ID_PREFIX) {
        return Err("messageId has an unknown format".to_string());
    }
    let owned = message_id
        .strip_suffix(user_id)
        .is_some_and(|rest| rest.len() > MESSAGE_ID_PREFIX.len() + 1 && rest.ends_with('_'));
    if !owned {
        return Err("messageId belongs to another user".to_string());
    }
    Ok(())
}

fn rejected(user_id: &str, event: Option<&str>, reason: String) -> InboundOutcome {
    tracing::warn!(user_id, event = event.unwrap_or("-"), reason = %reason, "Ignoring inbound frame");
    InboundOutcome::Rejected(reason)
}

fn store_error(user_id: &str, message_id: &str, error: String) -> InboundOutcome {
    tracing::error!(user_id, message_id, error = %error, "Pending delivery store error");
    InboundOutcome::StoreError(error)
}
