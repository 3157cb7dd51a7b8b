use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;

use herald_common::config::AppConfig;
use herald_common::db;
use herald_common::redis_pool::{create_redis_pool, open_client};
use herald_engine::broker::RedisStreamsBroker;
use herald_engine::collaborators::PgCollaborators;
use herald_engine::fanout::{FanoutBus, FanoutEmitter, MemoryFanout, RedisFanout};
use herald_engine::rate_limit::RateLimiter;
use herald_engine::store::RedisStore;
use herald_notifier::delivery::Collaborators;
use herald_notifier::worker::{Worker, WorkerDeps};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_notifier=info,herald_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald notifier starting...");

    let config = AppConfig::from_env()?;

    if let Some(port) = config.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new()
            .add_global_label("instance", config.instance_id.clone())
            .with_http_listener(addr)
            .install()?;
        tracing::info!("Metrics listening on {}/metrics", addr);
    }

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    let redis = create_redis_pool(&config.redis_url).await?;
    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let broker = Arc::new(RedisStreamsBroker::new(redis.clone()));

    let bus: Arc<dyn FanoutBus> = if config.fanout.enabled {
        let client = open_client(&config.redis_url)?;
        Arc::new(RedisFanout::new(client, redis.clone(), &config.fanout.channel))
    } else if config.fanout.required {
        anyhow::bail!("realtime fan-out is required but REALTIME_FANOUT_ENABLED=false");
    } else {
        tracing::warn!("Realtime fan-out disabled, live pushes will time out and fall back to persistence");
        Arc::new(MemoryFanout::new())
    };

    let limiter = Arc::new(RateLimiter::outbound(store.clone(), config.rate_limit.clone()));
    let emitter = Arc::new(FanoutEmitter::new(bus, limiter, &config.instance_id));

    let worker = Worker::new(
        &config,
        WorkerDeps {
            broker,
            store: store.clone(),
            dedup: store.clone(),
            emitter,
            collaborators: Collaborators::from_shared(Arc::new(PgCollaborators::new(pool))),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut run = tokio::spawn(worker.run(shutdown_rx));

    tokio::select! {
        result = &mut run => {
            result??;
            tracing::warn!("Worker exited without a shutdown signal");
            store.close();
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    shutdown_tx.send(true)?;
    run.await??;
    store.close();

    tracing::info!("Herald notifier stopped.");
    Ok(())
}
