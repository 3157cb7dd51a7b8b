//! Realtime gateway: local sockets, rooms and the cross-instance bus.
//!
//! Emits on this instance are delivered to local sockets directly and published
//! on the bus for the other instances. The fan-out subscriber forwards messages
//! from other origins to local sockets, and resubscribes with exponential backoff
//! when its stream ends.

pub mod inbound;
pub mod rooms;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::watch;

use herald_common::config::FanoutConfig;
use herald_common::types::{RealtimeFrame, Room};
use herald_engine::fanout::{EmitOutcome, FanoutBus, FanoutError, FanoutMessage, RealtimeEmitter};
use herald_engine::rate_limit::RateLimiter;

pub use self::rooms::{ConnectionId, RoomRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutMode {
    Distributed,
    LocalOnly,
}

impl FanoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FanoutMode::Distributed => "distributed",
            FanoutMode::LocalOnly => "local-only",
        }
    }
}

/// How the fan-out subscriber recovers from a closed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResubscribePolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Give up after this long without a subscription; `None` retries forever.
    pub max_elapsed: Option<Duration>,
}

impl ResubscribePolicy {
    /// Required fan-out gives up after a minute so the process fails loudly;
    /// optional fan-out keeps trying.
    pub fn for_config(config: &FanoutConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            max_elapsed: config.required.then(|| Duration::from_secs(60)),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: self.max_elapsed,
            ..Default::default()
        }
    }
}

pub struct Gateway {
    instance_id: String,
    rooms: RoomRegistry,
    limiter: Arc<RateLimiter>,
    bus: Option<Arc<dyn FanoutBus>>,
}

impl Gateway {
    pub fn new(
        instance_id: impl Into<String>,
        limiter: Arc<RateLimiter>,
        bus: Option<Arc<dyn FanoutBus>>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            rooms: RoomRegistry::new(),
            limiter,
            bus,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn mode(&self) -> FanoutMode {
        if self.bus.is_some() {
            FanoutMode::Distributed
        } else {
            FanoutMode::LocalOnly
        }
    }

    /// Push to this instance's sockets only. Returns the number of connections reached.
    pub fn deliver_local(&self, room: &Room, event: &str, payload: serde_json::Value) -> usize {
        let frame = RealtimeFrame {
            event: event.to_string(),
            data: payload,
        };
        self.rooms.send(room, &frame)
    }

    /// Forward bus messages from other instances to local sockets until shutdown.
    ///
    /// A closed stream is replaced by a fresh subscription. Returns an error when
    /// resubscribing gives up, which only happens under a bounded `policy`.
    pub async fn run_fanout_subscriber(
        self: Arc<Self>,
        mut stream: BoxStream<'static, FanoutMessage>,
        policy: ResubscribePolicy,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tracing::info!(instance_id = %self.instance_id, "Fan-out subscriber started");

        loop {
            tokio::select! {
                next = stream.next() => {
                    let Some(message) = next else {
                        tracing::warn!("Fan-out stream closed, resubscribing");
                        match self.resubscribe(&policy, &mut shutdown).await? {
                            Some(fresh) => {
                                stream = fresh;
                                continue;
                            }
                            None => break,
                        }
                    };
                    if message.origin == self.instance_id {
                        continue;
                    }
                    let reached = self.deliver_local(&message.room, &message.event, message.payload);
                    tracing::debug!(
                        origin = %message.origin,
                        room = %message.room,
                        event = %message.event,
                        reached,
                        "Fan-out message delivered"
                    );
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("Fan-out subscriber stopped");
        Ok(())
    }

    /// `Ok(None)` when shutdown arrived first.
    async fn resubscribe(
        &self,
        policy: &ResubscribePolicy,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<Option<BoxStream<'static, FanoutMessage>>> {
        let Some(bus) = self.bus.clone() else {
            anyhow::bail!("fan-out stream closed on a gateway without a bus");
        };

        let attempt = backoff::future::retry(policy.backoff(), || {
            let bus = bus.clone();
            async move {
                bus.subscribe().await.map_err(|e| {
                    tracing::warn!(error = %e, "Fan-out resubscribe failed");
                    backoff::Error::Transient(e)
                })
            }
        });

        tokio::select! {
            result = attempt => match result {
                Ok(stream) => {
                    tracing::info!(instance_id = %self.instance_id, "Fan-out resubscribed");
                    Ok(Some(stream))
                }
                Err(e) => {
                    tracing::error!(error = %e, "Giving up on fan-out, cross-instance delivery lost");
                    Err(anyhow::Error::new(e).context("fan-out resubscribe gave up"))
                }
            },
            _ = shutdown.changed() => Ok(None),
        }
    }
}

#[async_trait]
impl RealtimeEmitter for Gateway {
    async fn emit(
        &self,
        room: &Room,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<EmitOutcome, FanoutError> {
        if !self.limiter.check(&room.to_string(), event).await.allowed {
            return Ok(EmitOutcome::RateLimited);
        }

        let Some(bus) = &self.bus else {
            self.deliver_local(room, event, payload);
            return Ok(EmitOutcome::Sent);
        };

        self.deliver_local(room, event, payload.clone());
        let message = FanoutMessage {
            origin: self.instance_id.clone(),
            room: room.clone(),
            event: event.to_string(),
            payload,
        };
        if let Err(e) = bus.publish(&message).await {
            tracing::warn!(room = %room, event, error = %e, "Fan-out publish failed, delivered locally only");
        }
        Ok(EmitOutcome::Sent)
    }
}

/// A connected bus together with this instance's subscription to it.
pub struct FanoutLink {
    pub bus: Arc<dyn FanoutBus>,
    pub stream: BoxStream<'static, FanoutMessage>,
}

/// Set up cross-instance fan-out. When fan-out is required any failure is fatal;
/// otherwise the gateway falls back to local-only delivery.
pub async fn establish_fanout(
    config: &FanoutConfig,
    connect: anyhow::Result<Arc<dyn FanoutBus>>,
) -> anyhow::Result<Option<FanoutLink>> {
    if !config.enabled {
        if config.required {
            anyhow::bail!("realtime fan-out is required but REALTIME_FANOUT_ENABLED is false");
        }
        tracing::warn!("Realtime fan-out disabled, running local-only");
        return Ok(None);
    }

    let attempt = async move {
        let bus = connect?;
        let stream = bus.subscribe().await?;
        anyhow::Ok(FanoutLink { bus, stream })
    };

    match attempt.await {
        Ok(link) => {
            tracing::info!(channel = %config.channel, "Realtime fan-out established");
            Ok(Some(link))
        }
        Err(e) if config.required => Err(e.context("realtime fan-out setup failed")),
        Err(e) => {
            tracing::warn!(error = %e, "Realtime fan-out unavailable, running local-only");
            Ok(None)
        }
    }
}
