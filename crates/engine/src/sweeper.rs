//! Periodic cleanup of the pending-delivery store.
//!
//! Each pass publishes `herald_pending_deliveries` (gauge) and
//! `herald_pending_evicted_total` (counter).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::store::{PendingDeliveryStore, SweepReport};

pub const METRIC_PENDING: &str = "herald_pending_deliveries";
pub const METRIC_EVICTED: &str = "herald_pending_evicted_total";
pub const METRIC_SWEEP_FAILURES: &str = "herald_pending_sweep_failures_total";

/// Run `sweep` every `interval` until `shutdown` flips to `true`.
pub async fn run_cleanup(
    store: Arc<dyn PendingDeliveryStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately.
    ticker.tick().await;

    tracing::info!(interval_ms = interval.as_millis() as u64, "Pending delivery sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_once(store.as_ref()).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!("Pending delivery sweeper stopped");
}

pub async fn sweep_once(store: &dyn PendingDeliveryStore) -> Option<SweepReport> {
    match store.sweep().await {
        Ok(report) => {
            metrics::gauge!(METRIC_PENDING).set(report.pending as f64);
            metrics::counter!(METRIC_EVICTED).increment(report.evicted as u64);
            if report.evicted > 0 {
                tracing::info!(
                    pending = report.pending,
                    evicted = report.evicted,
                    "Evicted expired pending deliveries"
                );
            } else {
                tracing::debug!(pending = report.pending, "Pending delivery sweep");
            }
            Some(report)
        }
        Err(e) => {
            metrics::counter!(METRIC_SWEEP_FAILURES).increment(1);
            tracing::warn!(error = %e, "Pending delivery sweep failed");
            None
        }
    }
}
