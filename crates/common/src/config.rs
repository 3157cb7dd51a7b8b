use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Deployment environment. Production makes cross-instance fan-out mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(anyhow::anyhow!("APP_ENV has unknown value '{}'", other)),
        }
    }
}

/// Global application configuration loaded once at process start.
///
/// Every component receives the parts it needs from this struct; nothing reads the
/// environment after `from_env` returns.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Deployment environment (`APP_ENV`, default: development)
    pub environment: Environment,

    /// Identifier of this process in fan-out messages (`INSTANCE_ID`, default: random)
    pub instance_id: String,

    /// Redis connection string
    pub redis_url: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 10)
    pub db_max_connections: u32,

    /// JWT secret used to validate gateway handshakes
    pub jwt_secret: String,

    /// Port the realtime gateway listens on (default: 3000)
    pub gateway_port: u16,

    /// Prometheus scrape port of the notifier (`METRICS_PORT`, unset: no listener).
    /// The gateway serves `/metrics` on its own port.
    pub metrics_port: Option<u16>,

    /// Confirmation protocol timings
    pub delivery: DeliveryConfig,

    /// Outbound (server → client) rate limit
    pub rate_limit: RateLimitConfig,

    /// Inbound (client → server) rate limit
    pub inbound_rate_limit: RateLimitConfig,

    /// Cross-instance fan-out settings
    pub fanout: FanoutConfig,

    /// Per-queue overrides keyed by the env-style queue name (`NOTIFICATIONS_DELIVER`)
    queue_overrides: HashMap<String, QueueOverrides>,
}

/// Timings for the delivery confirmation protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    /// TTL of a pending delivery record (`DELIVERY_CONFIRMATION_TTL`, seconds, default 60)
    pub confirmation_ttl: Duration,
    /// Overall wait for client confirmations (`DELIVERY_TIMEOUT_MS`, default 60000)
    pub confirmation_timeout: Duration,
    /// First poll interval (`DELIVERY_POLL_INTERVAL_MS`, default 500)
    pub poll_interval: Duration,
    /// Upper bound for the backed-off poll interval (`DELIVERY_MAX_POLL_INTERVAL_MS`, default 2000)
    pub max_poll_interval: Duration,
    /// Sweep interval of the auto-cleanup loop (`AUTO_CLEANUP_INTERVAL_MS`, default 60000)
    pub cleanup_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            confirmation_ttl: Duration::from_secs(60),
            confirmation_timeout: Duration::from_millis(60_000),
            poll_interval: Duration::from_millis(500),
            max_poll_interval: Duration::from_millis(2_000),
            cleanup_interval: Duration::from_millis(60_000),
        }
    }
}

/// Fixed-window rate limit with optional per-event maximums.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max: u64,
    /// Keyed by env-style event name, e.g. `NOTIFICATION_CREATED`.
    pub per_event: HashMap<String, u64>,
}

impl RateLimitConfig {
    pub fn new(window: Duration, max: u64) -> Self {
        Self {
            window,
            max,
            per_event: HashMap::new(),
        }
    }

    /// Add a per-event maximum, e.g. `with_event_max("notification.created", 5)`.
    pub fn with_event_max(mut self, event: &str, max: u64) -> Self {
        self.per_event.insert(env_key(event), max);
        self
    }

    /// Maximum for `event`: the event-specific override when present, the global max otherwise.
    pub fn max_for(&self, event: &str) -> u64 {
        self.per_event
            .get(&env_key(event))
            .copied()
            .unwrap_or(self.max)
    }
}

/// Cross-instance fan-out settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FanoutConfig {
    /// `REALTIME_FANOUT_ENABLED` (default: true)
    pub enabled: bool,
    /// Startup fails when fan-out cannot be set up. Forced on in production.
    pub required: bool,
    /// Redis pub/sub channel
    pub channel: String,
}

/// Consumer settings for one queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    pub prefetch: usize,
    pub max_retries: u32,
    pub dedup_ttl: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct QueueOverrides {
    prefetch: Option<usize>,
    max_retries: Option<u32>,
    dedup_ttl_seconds: Option<u64>,
}

/// Environment-style spelling of a queue or event name:
/// `notification.delivery.failed` → `NOTIFICATION_DELIVERY_FAILED`.
pub fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl AppConfig {
    /// Load configuration from environment variables (and `.env`, when present).
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Build configuration from an explicit variable list.
    pub fn from_vars<I>(vars: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();

        let environment = match vars.get("APP_ENV") {
            Some(value) => value.parse()?,
            None => Environment::Development,
        };

        let delivery = DeliveryConfig {
            confirmation_ttl: Duration::from_secs(parse_or(
                &vars,
                "DELIVERY_CONFIRMATION_TTL",
                60u64,
            )?),
            confirmation_timeout: Duration::from_millis(parse_or(
                &vars,
                "DELIVERY_TIMEOUT_MS",
                60_000u64,
            )?),
            poll_interval: Duration::from_millis(parse_or(
                &vars,
                "DELIVERY_POLL_INTERVAL_MS",
                500u64,
            )?),
            max_poll_interval: Duration::from_millis(parse_or(
                &vars,
                "DELIVERY_MAX_POLL_INTERVAL_MS",
                2_000u64,
            )?),
            cleanup_interval: Duration::from_millis(parse_or(
                &vars,
                "AUTO_CLEANUP_INTERVAL_MS",
                60_000u64,
            )?),
        };

        let rate_limit = parse_rate_limit(&vars, "RATE_LIMIT", 1_000, 50)?;
        let inbound_rate_limit = parse_rate_limit(&vars, "INBOUND_RATE_LIMIT", 1_000, 20)?;

        let fanout = FanoutConfig {
            enabled: parse_or(&vars, "REALTIME_FANOUT_ENABLED", true)?,
            required: environment == Environment::Production
                || parse_or(&vars, "REALTIME_FANOUT_REQUIRED", false)?,
            channel: vars
                .get("REALTIME_FANOUT_CHANNEL")
                .cloned()
                .unwrap_or_else(|| "herald:fanout".to_string()),
        };

        Ok(Self {
            environment,
            instance_id: vars
                .get("INSTANCE_ID")
                .cloned()
                .unwrap_or_else(|| format!("herald-{}", uuid::Uuid::new_v4().simple())),
            redis_url: vars
                .get("REDIS_URL")
                .cloned()
                .unwrap_or_else(|| "redis://localhost:6379".to_string()),
            database_url: vars
                .get("DATABASE_URL")
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: parse_or(&vars, "DB_MAX_CONNECTIONS", 10u32)?,
            jwt_secret: vars
                .get("JWT_SECRET")
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("JWT_SECRET environment variable is required"))?,
            gateway_port: parse_or(&vars, "GATEWAY_PORT", 3000u16)?,
            metrics_port: vars
                .get("METRICS_PORT")
                .map(|raw| {
                    raw.trim()
                        .parse()
                        .map_err(|_| anyhow::anyhow!("METRICS_PORT has invalid value '{}'", raw))
                })
                .transpose()?,
            delivery,
            rate_limit,
            inbound_rate_limit,
            fanout,
            queue_overrides: parse_queue_overrides(&vars)?,
        })
    }

    /// Settings for `queue`, with `QUEUE_<NAME>_*` variables applied over `defaults`.
    pub fn queue(&self, queue: &str, defaults: QueueSettings) -> QueueSettings {
        let Some(overrides) = self.queue_overrides.get(&env_key(queue)) else {
            return defaults;
        };

        QueueSettings {
            prefetch: overrides.prefetch.unwrap_or(defaults.prefetch),
            max_retries: overrides.max_retries.unwrap_or(defaults.max_retries),
            dedup_ttl: overrides
                .dedup_ttl_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.dedup_ttl),
        }
    }
}

fn parse_or<T: FromStr>(vars: &HashMap<String, String>, key: &str, default: T) -> anyhow::Result<T> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has invalid value '{}'", key, raw)),
        None => Ok(default),
    }
}

fn parse_rate_limit(
    vars: &HashMap<String, String>,
    prefix: &str,
    default_window_ms: u64,
    default_max: u64,
) -> anyhow::Result<RateLimitConfig> {
    let window_ms = parse_or(vars, &format!("{prefix}_WINDOW_MS"), default_window_ms)?;
    let max = parse_or(vars, &format!("{prefix}_MAX"), default_max)?;

    let event_prefix = format!("{prefix}_MAX_");
    let mut per_event = HashMap::new();
    for (key, raw) in vars {
        if let Some(event) = key.strip_prefix(&event_prefix) {
            let value = raw
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("{} has invalid value '{}'", key, raw))?;
            per_event.insert(event.to_string(), value);
        }
    }

    Ok(RateLimitConfig {
        window: Duration::from_millis(window_ms),
        max,
        per_event,
    })
}

fn parse_queue_overrides(
    vars: &HashMap<String, String>,
) -> anyhow::Result<HashMap<String, QueueOverrides>> {
    let mut overrides: HashMap<String, QueueOverrides> = HashMap::new();

    for (key, raw) in vars {
        let Some(rest) = key.strip_prefix("QUEUE_") else {
            continue;
        };
        let invalid = || anyhow::anyhow!("{} has invalid value '{}'", key, raw);

        if let Some(name) = rest.strip_suffix("_PREFETCH") {
            overrides.entry(name.to_string()).or_default().prefetch =
                Some(raw.trim().parse().map_err(|_| invalid())?);
        } else if let Some(name) = rest.strip_suffix("_RETRY_MAX") {
            overrides.entry(name.to_string()).or_default().max_retries =
                Some(raw.trim().parse().map_err(|_| invalid())?);
        } else if let Some(name) = rest.strip_suffix("_DEDUP_TTL_SECONDS") {
            overrides.entry(name.to_string()).or_default().dedup_ttl_seconds =
                Some(raw.trim().parse().map_err(|_| invalid())?);
        }
    }

    Ok(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> Vec<(String, String)> {
        vec![
            ("DATABASE_URL".to_string(), "postgres://localhost/herald".to_string()),
            ("JWT_SECRET".to_string(), "secret".to_string()),
        ]
    }

    fn with(mut vars: Vec<(String, String)>, key: &str, value: &str) -> Vec<(String, String)> {
        vars.push((key.to_string(), value.to_string()));
        vars
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_vars(base_vars()).unwrap();
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.delivery, DeliveryConfig::default());
        assert_eq!(config.gateway_port, 3000);
        assert_eq!(config.metrics_port, None);
        assert!(config.fanout.enabled);
        assert!(!config.fanout.required);
        assert!(config.instance_id.starts_with("herald-"));
    }

    #[test]
    fn test_metrics_port() {
        let config = AppConfig::from_vars(with(base_vars(), "METRICS_PORT", "9100")).unwrap();
        assert_eq!(config.metrics_port, Some(9100));
        assert!(AppConfig::from_vars(with(base_vars(), "METRICS_PORT", "nope")).is_err());
    }

    #[test]
    fn test_missing_jwt_secret_is_an_error() {
        let vars = vec![("DATABASE_URL".to_string(), "postgres://x".to_string())];
        assert!(AppConfig::from_vars(vars).is_err());
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let vars = with(base_vars(), "DELIVERY_TIMEOUT_MS", "soon");
        let err = AppConfig::from_vars(vars).unwrap_err();
        assert!(err.to_string().contains("DELIVERY_TIMEOUT_MS"));
    }

    #[test]
    fn test_production_requires_fanout() {
        let vars = with(base_vars(), "APP_ENV", "production");
        let config = AppConfig::from_vars(vars).unwrap();
        assert!(config.fanout.required);
    }

    #[test]
    fn test_per_event_rate_limit_override() {
        let vars = with(base_vars(), "RATE_LIMIT_MAX", "3");
        let vars = with(vars, "RATE_LIMIT_MAX_NOTIFICATION_CREATED", "5");
        let vars = with(vars, "INBOUND_RATE_LIMIT_MAX_NOTIFICATION_DELIVERED", "7");
        let config = AppConfig::from_vars(vars).unwrap();

        assert_eq!(config.rate_limit.max_for("notification.created"), 5);
        assert_eq!(config.rate_limit.max_for("member.joined"), 3);
        assert_eq!(config.inbound_rate_limit.max_for("notification.delivered"), 7);
        assert!(config.rate_limit.per_event.get("NOTIFICATION_DELIVERED").is_none());
    }

    #[test]
    fn test_queue_overrides() {
        let vars = with(base_vars(), "QUEUE_NOTIFICATIONS_DELIVER_PREFETCH", "4");
        let vars = with(vars, "QUEUE_NOTIFICATIONS_DELIVER_RETRY_MAX", "5");
        let config = AppConfig::from_vars(vars).unwrap();

        let defaults = QueueSettings {
            prefetch: 10,
            max_retries: 3,
            dedup_ttl: Duration::from_secs(120),
        };
        let settings = config.queue("notifications.deliver", defaults.clone());
        assert_eq!(settings.prefetch, 4);
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.dedup_ttl, Duration::from_secs(120));

        assert_eq!(config.queue("events.domain", defaults.clone()), defaults);
    }

    #[test]
    fn test_env_key() {
        assert_eq!(env_key("notification.delivery.failed"), "NOTIFICATION_DELIVERY_FAILED");
        assert_eq!(env_key("friend_request.sent"), "FRIEND_REQUEST_SENT");
    }
}
