//! End-to-end tests for the notification worker.
//!
//! Everything runs in-process: in-memory broker, store and collaborators, and a
//! simulated client standing in for the gateway plus a connected browser.
//!
//! ```bash
//! cargo test -p herald-notifier --test integration -- --nocapture
//! ```

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};

use herald_common::config::AppConfig;
use herald_common::types::{NotificationKind, Room, events, queues};
use herald_engine::broker::{Broker, MemoryBroker, QueueMessage};
use herald_engine::collaborators::MemoryCollaborators;
use herald_engine::consumer::Outcome;
use herald_engine::fanout::{EmitOutcome, FanoutError, RealtimeEmitter};
use herald_engine::store::{MemoryStore, PendingDeliveryStore};
use herald_notifier::delivery::Collaborators;
use herald_notifier::worker::{Worker, WorkerDeps};

// ============================================================
// Helpers
// ============================================================

/// How the simulated client reacts to `notification.created`.
#[derive(Clone, Copy)]
enum ClientBehavior {
    ConfirmAfter(Duration),
    ReportFailureAfter(Duration),
    Ignore,
}

struct SimulatedClient {
    store: Arc<MemoryStore>,
    behavior: ClientBehavior,
    pushes: Mutex<Vec<(Room, String, Value)>>,
}

impl SimulatedClient {
    fn new(store: Arc<MemoryStore>, behavior: ClientBehavior) -> Self {
        Self {
            store,
            behavior,
            pushes: Mutex::new(Vec::new()),
        }
    }

    fn pushes(&self) -> Vec<(Room, String, Value)> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl RealtimeEmitter for SimulatedClient {
    async fn emit(
        &self,
        room: &Room,
        event: &str,
        payload: Value,
    ) -> Result<EmitOutcome, FanoutError> {
        self.pushes
            .lock()
            .unwrap()
            .push((room.clone(), event.to_string(), payload.clone()));

        if event != events::NOTIFICATION_CREATED {
            return Ok(EmitOutcome::Sent);
        }

        let message_id = payload["messageId"].as_str().unwrap().to_string();
        let store = self.store.clone();
        match self.behavior {
            ClientBehavior::ConfirmAfter(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    store.confirm_delivery(&message_id).await.unwrap();
                });
            }
            ClientBehavior::ReportFailureAfter(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    store.remove_pending_delivery(&message_id).await.unwrap();
                });
            }
            ClientBehavior::Ignore => {}
        }
        Ok(EmitOutcome::Sent)
    }
}

struct Harness {
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryStore>,
    collaborators: Arc<MemoryCollaborators>,
    client: Arc<SimulatedClient>,
    worker: Worker,
}

fn test_config(timeout_ms: u64) -> AppConfig {
    let timeout = timeout_ms.to_string();
    AppConfig::from_vars(
        [
            ("DATABASE_URL", "postgres://unused"),
            ("JWT_SECRET", "test-jwt-secret"),
            ("INSTANCE_ID", "test-worker"),
            ("DELIVERY_TIMEOUT_MS", timeout.as_str()),
            ("DELIVERY_POLL_INTERVAL_MS", "20"),
            ("DELIVERY_MAX_POLL_INTERVAL_MS", "100"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string())),
    )
    .unwrap()
}

fn harness(behavior: ClientBehavior, timeout_ms: u64) -> Harness {
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryStore::new());
    let collaborators = Arc::new(MemoryCollaborators::new());
    let client = Arc::new(SimulatedClient::new(store.clone(), behavior));

    let worker = Worker::new(
        &test_config(timeout_ms),
        WorkerDeps {
            broker: broker.clone(),
            store: store.clone(),
            dedup: store.clone(),
            emitter: client.clone(),
            collaborators: Collaborators::from_shared(collaborators.clone()),
        },
    );

    Harness {
        broker,
        store,
        collaborators,
        client,
        worker,
    }
}

async fn publish(broker: &MemoryBroker, queue: &str, payload: Value) {
    broker
        .publish(queue, QueueMessage::json(&payload).unwrap())
        .await
        .unwrap();
}

fn invite_for_u1() -> Value {
    json!({
        "eventId": "INVITE_CREATED",
        "receiver": { "id": "u1" },
        "inviteId": "inv-1",
        "tenantId": "c1",
        "companyName": "Acme"
    })
}

// ============================================================
// Tests
// ============================================================

#[tokio::test]
async fn test_confirmed_delivery_persists_once_and_clears_store() {
    let h = harness(ClientBehavior::ConfirmAfter(Duration::from_millis(100)), 5_000);
    publish(&h.broker, queues::NOTIFICATIONS_DELIVER, invite_for_u1()).await;

    let started = Instant::now();
    let outcomes = h.worker.notifications().drain().await.unwrap();

    assert_eq!(outcomes, vec![Outcome::Processed]);
    assert!(started.elapsed() < Duration::from_secs(2));

    let pushes = h.client.pushes();
    assert_eq!(pushes.len(), 1);
    let (room, event, payload) = &pushes[0];
    assert_eq!(room, &Room::user("u1"));
    assert_eq!(event, events::NOTIFICATION_CREATED);
    let message_id = payload["messageId"].as_str().unwrap();
    assert!(message_id.starts_with("msg_") && message_id.ends_with("_u1"));

    let persisted = h.collaborators.persisted();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].user_id, "u1");
    assert_eq!(persisted[0].message_id, message_id);
    assert_eq!(persisted[0].kind, NotificationKind::InviteCreated);
    assert_eq!(persisted[0].tenant_id.as_deref(), Some("c1"));
    assert!(persisted[0].delivered_live);

    assert_eq!(h.store.pending_count(), 0);
    assert!(h.store.list_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_live_delivery_disabled_persists_without_push() {
    let h = harness(ClientBehavior::ConfirmAfter(Duration::from_millis(10)), 5_000);
    h.collaborators.mute("u1", NotificationKind::InviteCreated);
    publish(&h.broker, queues::NOTIFICATIONS_DELIVER, invite_for_u1()).await;

    let outcomes = h.worker.notifications().drain().await.unwrap();

    assert_eq!(outcomes, vec![Outcome::Processed]);
    assert!(h.client.pushes().is_empty());
    assert_eq!(h.store.pending_count(), 0);

    let persisted = h.collaborators.persisted_for("u1");
    assert_eq!(persisted.len(), 1);
    assert!(!persisted[0].delivered_live);
}

#[tokio::test]
async fn test_unconfirmed_delivery_falls_back_after_timeout() {
    let h = harness(ClientBehavior::Ignore, 1_000);
    publish(&h.broker, queues::NOTIFICATIONS_DELIVER, invite_for_u1()).await;

    let started = Instant::now();
    let outcomes = h.worker.notifications().drain().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcomes, vec![Outcome::Processed]);
    assert!(elapsed >= Duration::from_millis(1_000));
    assert!(elapsed < Duration::from_millis(3_000));

    let persisted = h.collaborators.persisted();
    assert_eq!(persisted.len(), 1);
    assert!(!persisted[0].delivered_live);
    assert_eq!(h.store.pending_count(), 0);
    assert!(h.broker.dead_letters("dlq.notifications.deliver").is_empty());
}

#[tokio::test]
async fn test_client_reported_failure_is_persisted_before_timeout() {
    let h = harness(
        ClientBehavior::ReportFailureAfter(Duration::from_millis(50)),
        10_000,
    );
    publish(&h.broker, queues::NOTIFICATIONS_DELIVER, invite_for_u1()).await;

    let started = Instant::now();
    h.worker.notifications().drain().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    let persisted = h.collaborators.persisted();
    assert_eq!(persisted.len(), 1);
    assert!(!persisted[0].delivered_live);
}

#[tokio::test]
async fn test_redelivered_job_is_processed_once() {
    let h = harness(ClientBehavior::ConfirmAfter(Duration::from_millis(10)), 5_000);
    publish(&h.broker, queues::NOTIFICATIONS_DELIVER, invite_for_u1()).await;
    h.worker.notifications().drain().await.unwrap();

    publish(&h.broker, queues::NOTIFICATIONS_DELIVER, invite_for_u1()).await;
    let outcomes = h.worker.notifications().drain().await.unwrap();

    assert_eq!(outcomes, vec![Outcome::Duplicate]);
    assert_eq!(h.collaborators.persisted().len(), 1);
    assert_eq!(h.client.pushes().len(), 1);
}

#[tokio::test]
async fn test_concurrent_copies_of_one_job_persist_once() {
    let h = harness(ClientBehavior::ConfirmAfter(Duration::from_millis(20)), 5_000);
    for _ in 0..3 {
        publish(&h.broker, queues::NOTIFICATIONS_DELIVER, invite_for_u1()).await;
    }

    let outcomes = h.worker.notifications().drain().await.unwrap();

    assert_eq!(outcomes.iter().filter(|o| **o == Outcome::Processed).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| **o == Outcome::Duplicate).count(), 2);
    assert_eq!(h.collaborators.persisted_for("u1").len(), 1);
    assert_eq!(h.client.pushes().len(), 1);
}

#[tokio::test]
async fn test_retry_does_not_persist_settled_recipients_again() {
    let h = harness(ClientBehavior::ConfirmAfter(Duration::from_millis(20)), 5_000);
    h.collaborators.mute("u2", NotificationKind::MemberJoined);
    h.collaborators.fail_next_persist_for("u2");
    publish(
        &h.broker,
        queues::NOTIFICATIONS_DELIVER,
        json!({
            "eventId": "MEMBER_JOINED",
            "recipients": ["u1", "u2"],
            "tenantId": "c1",
            "dedupKey": "member-joined:c1:u9"
        }),
    )
    .await;

    let outcomes = h.worker.notifications().drain().await.unwrap();

    assert_eq!(
        outcomes,
        vec![Outcome::Requeued { retry_count: 1 }, Outcome::Processed]
    );
    assert_eq!(h.collaborators.persisted_for("u1").len(), 1);
    assert_eq!(h.collaborators.persisted_for("u2").len(), 1);
    assert_eq!(h.store.pending_count(), 0);
}

#[tokio::test]
async fn test_multiple_recipients_each_get_their_own_message() {
    let h = harness(ClientBehavior::ConfirmAfter(Duration::from_millis(30)), 5_000);
    h.collaborators.mute("u3", NotificationKind::MemberJoined);
    publish(
        &h.broker,
        queues::NOTIFICATIONS_DELIVER,
        json!({
            "eventId": "MEMBER_JOINED",
            "recipients": ["u1", "u2", "u3"],
            "tenantId": "c1",
            "dedupKey": "member-joined:c1:u9"
        }),
    )
    .await;

    h.worker.notifications().drain().await.unwrap();

    let pushes = h.client.pushes();
    assert_eq!(pushes.len(), 2);

    let mut persisted = h.collaborators.persisted();
    persisted.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    assert_eq!(persisted.len(), 3);
    assert!(persisted[0].delivered_live && persisted[1].delivered_live);
    assert!(!persisted[2].delivered_live);
    assert_ne!(persisted[0].message_id, persisted[1].message_id);
    assert_eq!(h.store.pending_count(), 0);
}

#[tokio::test]
async fn test_persistence_failure_is_retried_then_dead_lettered() {
    let h = harness(ClientBehavior::Ignore, 1_000);
    h.collaborators.mute("u1", NotificationKind::InviteCreated);
    h.collaborators.set_fail_persist(true);
    publish(&h.broker, queues::NOTIFICATIONS_DELIVER, invite_for_u1()).await;

    let outcomes = h.worker.notifications().drain().await.unwrap();

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0], Outcome::Requeued { retry_count: 1 });
    assert_eq!(outcomes[1], Outcome::Requeued { retry_count: 2 });
    assert!(matches!(outcomes[2], Outcome::DeadLettered { .. }));
    assert_eq!(h.broker.dead_letters("dlq.notifications.deliver").len(), 1);
    assert!(h.collaborators.persisted().is_empty());
}

#[tokio::test]
async fn test_store_outage_fails_the_attempt_without_pushing() {
    let h = harness(ClientBehavior::Ignore, 1_000);
    publish(&h.broker, queues::NOTIFICATIONS_DELIVER, invite_for_u1()).await;
    let delivery = h
        .broker
        .fetch(queues::NOTIFICATIONS_DELIVER, "test", 1)
        .await
        .unwrap()
        .remove(0);

    h.store.set_unavailable(true);
    let outcome = h.worker.notifications().handle(delivery).await.unwrap();

    assert_eq!(outcome, Outcome::Requeued { retry_count: 1 });
    assert!(h.client.pushes().is_empty());
    assert!(h.collaborators.persisted().is_empty());
}

#[tokio::test]
async fn test_malformed_job_goes_straight_to_dead_letter() {
    let h = harness(ClientBehavior::Ignore, 1_000);
    publish(
        &h.broker,
        queues::NOTIFICATIONS_DELIVER,
        json!({ "eventId": "INVITE_CREATED" }),
    )
    .await;

    let outcomes = h.worker.notifications().drain().await.unwrap();

    assert!(matches!(outcomes.as_slice(), [Outcome::DeadLettered { .. }]));
    assert!(h.client.pushes().is_empty());
}

#[tokio::test]
async fn test_domain_event_flows_into_confirmed_notification() {
    let h = harness(ClientBehavior::ConfirmAfter(Duration::from_millis(20)), 5_000);
    h.collaborators.add_user("u5", "ada@example.com");
    publish(
        &h.broker,
        queues::EVENTS_DOMAIN,
        json!({
            "id": "evt-42",
            "type": "invite.created",
            "tenantId": "c1",
            "inviteId": "inv-9",
            "receiver": { "email": "ada@example.com" }
        }),
    )
    .await;

    let bridged = h.worker.domain_events().drain().await.unwrap();
    assert_eq!(bridged, vec![Outcome::Processed]);
    assert_eq!(h.broker.queue_len(queues::NOTIFICATIONS_DELIVER), 1);

    h.worker.notifications().drain().await.unwrap();

    let persisted = h.collaborators.persisted_for("u5");
    assert_eq!(persisted.len(), 1);
    assert!(persisted[0].delivered_live);
}

#[tokio::test]
async fn test_member_joined_is_broadcast_to_tenant_room() {
    let h = harness(ClientBehavior::Ignore, 200);
    publish(
        &h.broker,
        queues::EVENTS_DOMAIN,
        json!({ "id": "evt-7", "type": "member.joined", "tenantId": "c1", "userId": "u1" }),
    )
    .await;

    h.worker.domain_events().drain().await.unwrap();

    let pushes = h.client.pushes();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, Room::tenant("c1"));
    assert_eq!(pushes[0].1, events::MEMBER_JOINED);
}
