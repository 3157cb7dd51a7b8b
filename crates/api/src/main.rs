//! Herald realtime gateway binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::db::create_pool;
use herald_common::redis_pool::{create_redis_pool, open_client};
use herald_engine::collaborators::PgCollaborators;
use herald_engine::fanout::{FanoutBus, RedisFanout};
use herald_engine::rate_limit::RateLimiter;
use herald_engine::store::RedisStore;

use herald_api::gateway::{Gateway, ResubscribePolicy, establish_fanout};
use herald_api::routes::create_router;
use herald_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald_api=debug,herald_engine=info,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Herald realtime gateway...");

    let config = AppConfig::from_env()?;

    let metrics = PrometheusBuilder::new()
        .add_global_label("instance", config.instance_id.clone())
        .install_recorder()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    let redis = create_redis_pool(&config.redis_url).await?;
    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);

    let connect = open_client(&config.redis_url).map(|client| {
        Arc::new(RedisFanout::new(client, redis.clone(), &config.fanout.channel)) as Arc<dyn FanoutBus>
    });
    let link = establish_fanout(&config.fanout, connect).await?;
    let resubscribe = ResubscribePolicy::for_config(&config.fanout);

    let outbound = Arc::new(RateLimiter::outbound(store.clone(), config.rate_limit.clone()));
    let inbound = Arc::new(RateLimiter::inbound(store.clone(), config.inbound_rate_limit.clone()));

    let (bus, stream) = match link {
        Some(link) => (Some(link.bus), Some(link.stream)),
        None => (None, None),
    };
    let gateway = Arc::new(Gateway::new(&config.instance_id, outbound, bus));
    tracing::info!(
        instance_id = %config.instance_id,
        fanout = gateway.mode().as_str(),
        "Gateway initialized"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut subscriber = stream.map(|stream| {
        tokio::spawn(
            gateway
                .clone()
                .run_fanout_subscriber(stream, resubscribe, shutdown_rx.clone()),
        )
    });

    let port = config.gateway_port;
    let mut server_shutdown = shutdown_rx.clone();
    let state = AppState::new(
        config,
        gateway,
        store.clone(),
        Arc::new(PgCollaborators::new(pool)),
        inbound,
        shutdown_rx,
    )
    .with_metrics(metrics);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    // A subscriber that exits on its own has given up on required fan-out.
    let subscriber_exit = async {
        match subscriber.as_mut() {
            Some(handle) => Some(handle.await),
            None => std::future::pending().await,
        }
    };
    let early_exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Received shutdown signal, closing connections...");
            None
        }
        exit = subscriber_exit => exit,
    };
    if early_exit.is_some() {
        tracing::error!("Fan-out subscriber exited, shutting the gateway down");
    }

    let _ = shutdown_tx.send(true);
    server.await??;

    let subscriber_result = match early_exit {
        Some(exit) => Some(exit),
        None => match subscriber {
            Some(handle) => Some(handle.await),
            None => None,
        },
    };
    store.close();

    if let Some(result) = subscriber_result {
        result??;
    }

    tracing::info!("Herald gateway stopped.");
    Ok(())
}
