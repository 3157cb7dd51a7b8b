//! Fixed-window rate limiting on the shared counter store.
//!
//! Outbound buckets are keyed by `(room, event)`, inbound buckets by
//! `(connection identity, event)`. When the counter store cannot be reached the
//! limiter lets traffic through: infrastructure trouble must not block delivery.
//!
//! Metrics:
//! - `herald_rate_limit_rejections_total{direction, event}`: dropped events
//! - `herald_rate_limit_usage_ratio{direction, event}`: `count / max` per check,
//!   as a histogram for percentile reporting

use std::sync::Arc;

use herald_common::config::RateLimitConfig;

use crate::store::CounterStore;

pub const METRIC_REJECTIONS: &str = "herald_rate_limit_rejections_total";
pub const METRIC_USAGE_RATIO: &str = "herald_rate_limit_usage_ratio";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Direction::Outbound => "ratelimit:out",
            Direction::Inbound => "ratelimit:in",
        }
    }
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Count in the current window; `None` when the store was unreachable.
    pub count: Option<u64>,
    pub max: u64,
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
    direction: Direction,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig, direction: Direction) -> Self {
        Self {
            store,
            config,
            direction,
        }
    }

    pub fn outbound(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self::new(store, config, Direction::Outbound)
    }

    pub fn inbound(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self::new(store, config, Direction::Inbound)
    }

    /// Count one event for `subject` (a room or a connection identity) and decide
    /// whether it may pass.
    pub async fn check(&self, subject: &str, event: &str) -> RateDecision {
        let max = self.config.max_for(event);
        let key = format!("{}:{}:{}", self.direction.prefix(), subject, event);

        let count = match self.store.increment_in_window(&key, self.config.window).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "Rate limit store unavailable, allowing event"
                );
                return RateDecision {
                    allowed: true,
                    count: None,
                    max,
                };
            }
        };

        let ratio = if max == 0 { 1.0 } else { count as f64 / max as f64 };
        metrics::histogram!(
            METRIC_USAGE_RATIO,
            "direction" => self.direction.as_str(),
            "event" => event.to_string()
        )
        .record(ratio);

        let allowed = count <= max;
        if !allowed {
            metrics::counter!(
                METRIC_REJECTIONS,
                "direction" => self.direction.as_str(),
                "event" => event.to_string()
            )
            .increment(1);
            tracing::warn!(
                direction = self.direction.as_str(),
                subject,
                event,
                count,
                max,
                "Rate limit exceeded, dropping event"
            );
        }

        RateDecision {
            allowed,
            count: Some(count),
            max,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{counter, histogram, with_recorder};

    fn limiter(store: Arc<MemoryStore>, config: RateLimitConfig) -> RateLimiter {
        RateLimiter::outbound(store, config)
    }

    #[test]
    fn test_fourth_emit_is_dropped() {
        let snapshot = with_recorder(|| async {
            let store = Arc::new(MemoryStore::new());
            let limiter = limiter(store, RateLimitConfig::new(Duration::from_secs(60), 3));

            let mut delivered = 0;
            for _ in 0..4 {
                if limiter.check("user:u1", "member.joined").await.allowed {
                    delivered += 1;
                }
            }
            assert_eq!(delivered, 3);
        });

        assert_eq!(counter(&snapshot, METRIC_REJECTIONS), 1);
    }

    #[tokio::test]
    async fn test_event_override_takes_precedence() {
        let store = Arc::new(MemoryStore::new());
        let config = RateLimitConfig::new(Duration::from_secs(60), 3)
            .with_event_max("notification.created", 5);
        let limiter = limiter(store, config);

        let mut delivered = 0;
        for _ in 0..6 {
            if limiter.check("user:u1", "notification.created").await.allowed {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 5);
    }

    #[tokio::test]
    async fn test_buckets_are_per_room_and_event() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, RateLimitConfig::new(Duration::from_secs(60), 1));

        assert!(limiter.check("user:u1", "member.joined").await.allowed);
        assert!(limiter.check("user:u2", "member.joined").await.allowed);
        assert!(limiter.check("user:u1", "member.left").await.allowed);
        assert!(!limiter.check("user:u1", "member.joined").await.allowed);
    }

    #[test]
    fn test_store_outage_fails_open() {
        let snapshot = with_recorder(|| async {
            let store = Arc::new(MemoryStore::new());
            store.set_unavailable(true);
            let limiter = limiter(store, RateLimitConfig::new(Duration::from_secs(60), 0));

            let decision = limiter.check("user:u1", "member.joined").await;
            assert!(decision.allowed);
            assert_eq!(decision.count, None);
        });

        assert_eq!(counter(&snapshot, METRIC_REJECTIONS), 0);
        assert!(histogram(&snapshot, METRIC_USAGE_RATIO).is_empty());
    }

    #[test]
    fn test_usage_ratio_is_recorded_per_check() {
        let snapshot = with_recorder(|| async {
            let store = Arc::new(MemoryStore::new());
            let limiter = RateLimiter::inbound(store, RateLimitConfig::new(Duration::from_secs(60), 4));
            for _ in 0..4 {
                limiter.check("tenant:c1", "company.updated").await;
            }
        });

        let mut ratios = histogram(&snapshot, METRIC_USAGE_RATIO);
        ratios.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(ratios, vec![0.25, 0.5, 0.75, 1.0]);
    }
}
