use clap::Parser;
use pulsefm_cache::StateCache;
use pulsefm_core::config::Config;
use pulsefm_stream::{build_router, AppState, StreamHubState, StreamTimings};
use pulsefm_store::postgres::PgDatastore;
use pulsefm_store::redis_kv::RedisKvStore;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Debug, Parser)]
#[command(name = "pulsefm-stream", about = "PulseFM listener-facing SSE fan-out")]
struct Cli {
    #[arg(long, env = "PULSEFM_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,pulsefm_stream=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
        None => Config::load()?,
    };

    let ds = Arc::new(PgDatastore::connect(&config.datastore.url, config.datastore.max_connections).await?);
    let kv = Arc::new(RedisKvStore::connect(&config.kv.url).await?);
    let cache = Arc::new(StateCache::new(ds, kv.clone()));
    let hub = Arc::new(StreamHubState::with_staleness(
        cache,
        kv,
        config.stream.tally_cache_staleness_ms,
        config.stream.listener_cache_staleness_ms,
    ));

    let timings = StreamTimings {
        loop_sleep_ms: config.stream.loop_sleep_ms,
        tally_snapshot_interval_ms: (config.poll.tally_snapshot_interval_sec * 1000) as i64,
        stream_interval_ms: config.stream.stream_interval_ms as i64,
        heartbeat_ms: (config.stream.heartbeat_sec * 1000) as i64,
    };

    let app = build_router(AppState { hub, timings }).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.bind_addr, config.server.port);
    tracing::info!(%addr, "pulsefm-stream listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
