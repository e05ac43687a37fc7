use clap::Parser;
use pulsefm_cache::StateCache;
use pulsefm_core::config::Config;
use pulsefm_poll::PollEngine;
use pulsefm_store::http_event_bus::HttpForwardingEventBus;
use pulsefm_store::postgres::PgDatastore;
use pulsefm_store::redis_kv::RedisKvStore;
use pulsefm_vote::{build_router, AppState};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Debug, Parser)]
#[command(name = "pulsefm-vote", about = "PulseFM vote-admission service")]
struct Cli {
    #[arg(long, env = "PULSEFM_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,pulsefm_vote=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
        None => Config::load()?,
    };

    let ds = Arc::new(PgDatastore::connect(&config.datastore.url, config.datastore.max_connections).await?);
    let kv = Arc::new(RedisKvStore::connect(&config.kv.url).await?);
    let bus = Arc::new(HttpForwardingEventBus::new(config.eventbus.stream_base_url.clone()));
    let cache = Arc::new(StateCache::new(ds.clone(), kv.clone()));
    let poll = Arc::new(PollEngine::new(ds, kv, bus, cache));

    let app = build_router(AppState { poll }).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.bind_addr, config.server.port);
    tracing::info!(%addr, "pulsefm-vote listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
