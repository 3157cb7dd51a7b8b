//! Worker process wiring: the two consumers and the pending-delivery sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use herald_common::config::{AppConfig, QueueSettings};
use herald_common::types::queues;
use herald_engine::bridge::EventBridge;
use herald_engine::broker::Broker;
use herald_engine::consumer::{ConsumerConfig, ResilientConsumer};
use herald_engine::delivery::DeliveryAware;
use herald_engine::fanout::RealtimeEmitter;
use herald_engine::store::{DedupStore, PendingDeliveryStore};
use herald_engine::sweeper::run_cleanup;

use crate::delivery::{Collaborators, NotificationDelivery};

pub type NotificationConsumer = ResilientConsumer<DeliveryAware<NotificationDelivery>>;
pub type DomainEventConsumer = ResilientConsumer<EventBridge>;

/// `notifications.deliver` defaults. Each message may hold its slot for the whole
/// confirmation timeout, hence the modest prefetch.
pub fn notification_queue_defaults() -> QueueSettings {
    QueueSettings {
        prefetch: 10,
        max_retries: 3,
        dedup_ttl: Duration::from_secs(300),
    }
}

/// `events.domain` defaults.
pub fn domain_queue_defaults() -> QueueSettings {
    QueueSettings {
        prefetch: 20,
        max_retries: 5,
        dedup_ttl: Duration::from_secs(60),
    }
}

/// Handles the worker needs from the surrounding process.
#[derive(Clone)]
pub struct WorkerDeps {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn PendingDeliveryStore>,
    pub dedup: Arc<dyn DedupStore>,
    pub emitter: Arc<dyn RealtimeEmitter>,
    pub collaborators: Collaborators,
}

pub struct Worker {
    notifications: Arc<NotificationConsumer>,
    domain_events: Arc<DomainEventConsumer>,
    store: Arc<dyn PendingDeliveryStore>,
    cleanup_interval: Duration,
}

impl Worker {
    pub fn new(config: &AppConfig, deps: WorkerDeps) -> Self {
        let notification_handler = NotificationDelivery::new(
            deps.store.clone(),
            deps.emitter.clone(),
            deps.collaborators,
            config.delivery.clone(),
        );
        let notifications = ResilientConsumer::new(
            deps.broker.clone(),
            deps.dedup.clone(),
            Arc::new(DeliveryAware::new(notification_handler, deps.store.clone())),
            consumer_config(
                config,
                queues::NOTIFICATIONS_DELIVER,
                notification_queue_defaults(),
            ),
        );

        let domain_events = ResilientConsumer::new(
            deps.broker.clone(),
            deps.dedup,
            Arc::new(EventBridge::new(deps.broker, deps.emitter)),
            consumer_config(config, queues::EVENTS_DOMAIN, domain_queue_defaults()),
        );

        Self {
            notifications: Arc::new(notifications),
            domain_events: Arc::new(domain_events),
            store: deps.store,
            cleanup_interval: config.delivery.cleanup_interval,
        }
    }

    pub fn notifications(&self) -> &Arc<NotificationConsumer> {
        &self.notifications
    }

    pub fn domain_events(&self) -> &Arc<DomainEventConsumer> {
        &self.domain_events
    }

    /// Run both consumers and the sweeper until `shutdown` flips to `true`.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let notifications = tokio::spawn(self.notifications.clone().run(shutdown.clone()));
        let domain_events = tokio::spawn(self.domain_events.clone().run(shutdown.clone()));
        let sweeper = tokio::spawn(run_cleanup(
            self.store.clone(),
            self.cleanup_interval,
            shutdown,
        ));

        let (notifications, domain_events, sweeper) =
            tokio::join!(notifications, domain_events, sweeper);
        notifications??;
        domain_events??;
        sweeper?;

        tracing::info!("Worker stopped");
        Ok(())
    }
}

fn consumer_config(config: &AppConfig, queue: &str, defaults: QueueSettings) -> ConsumerConfig {
    ConsumerConfig::new(queue, config.queue(queue, defaults))
        .with_consumer_name(format!("{}-{}", config.instance_id, queue))
}
