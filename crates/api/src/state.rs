//! Shared application state for the realtime gateway.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;

use herald_common::config::AppConfig;
use herald_engine::collaborators::MembershipDirectory;
use herald_engine::rate_limit::RateLimiter;
use herald_engine::store::PendingDeliveryStore;

use crate::gateway::Gateway;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub gateway: Arc<Gateway>,
    pub store: Arc<dyn PendingDeliveryStore>,
    pub memberships: Arc<dyn MembershipDirectory>,
    /// Per (user, event) limit on client-to-server frames.
    pub inbound_limiter: Arc<RateLimiter>,
    /// Flips to `true` when the process is shutting down; open sockets close.
    pub shutdown: watch::Receiver<bool>,
    /// Renders `/metrics`; absent when no recorder was installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        gateway: Arc<Gateway>,
        store: Arc<dyn PendingDeliveryStore>,
        memberships: Arc<dyn MembershipDirectory>,
        inbound_limiter: Arc<RateLimiter>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            gateway,
            store,
            memberships,
            inbound_limiter,
            shutdown,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}
