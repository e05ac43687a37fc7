use clap::Parser;
use pulsefm_cache::StateCache;
use pulsefm_core::config::Config;
use pulsefm_poll::PollEngine;
use pulsefm_rotation::RotationEngine;
use pulsefm_store::http_event_bus::HttpForwardingEventBus;
use pulsefm_store::postgres::PgDatastore;
use pulsefm_store::redis_kv::RedisKvStore;
use pulsefm_store::taskqueue::HttpTaskQueue;
use pulsefm_control::{build_router, AppState};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Seeds the initial station record and stubbed song, exposed as a CLI flag
/// so a fresh deployment can bootstrap itself before serving traffic.
#[derive(Debug, Parser)]
#[command(name = "pulsefm-control", about = "PulseFM rotation + poll control plane")]
struct Cli {
    #[arg(long, env = "PULSEFM_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Seed the initial `stubbed` Song + StationRecord, then exit without
    /// serving traffic. Idempotent: a no-op if `stations/main` already exists.
    #[arg(long)]
    seed: bool,

    /// Duration (ms) of the fallback loop song written by `--seed`.
    #[arg(long, default_value_t = 150_000)]
    stubbed_duration_ms: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,pulsefm_control=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
        None => Config::load()?,
    };

    let ds = Arc::new(PgDatastore::connect(&config.datastore.url, config.datastore.max_connections).await?);
    ds.migrate().await?;

    if cli.seed {
        let seeded = ds.seed_bootstrap(cli.stubbed_duration_ms).await?;
        if seeded {
            tracing::info!(duration_ms = cli.stubbed_duration_ms, "seeded stubbed Song + StationRecord");
        } else {
            tracing::info!("StationRecord already exists, seed is a no-op");
        }
        return Ok(());
    }

    let kv = Arc::new(RedisKvStore::connect(&config.kv.url).await?);
    let bus = Arc::new(HttpForwardingEventBus::new(config.eventbus.stream_base_url.clone()));
    let tq = Arc::new(HttpTaskQueue::new(
        &config.kv.url,
        config.taskqueue.self_base_url.clone(),
        config.taskqueue.dedupe_ttl_slack_sec,
    )?);
    let cache = Arc::new(StateCache::new(ds.clone(), kv.clone()));
    let poll = Arc::new(PollEngine::new(ds.clone(), kv, bus.clone(), cache.clone()));
    let rotation = Arc::new(RotationEngine::new(
        ds.clone(),
        bus,
        tq,
        cache,
        poll.clone(),
        config.poll.options_per_window,
        config.taskqueue.vote_close_lead_sec,
    ));

    let now_ms = chrono::Utc::now().timestamp_millis();
    let delay_ms = rotation
        .bootstrap(
            cli.stubbed_duration_ms,
            config.taskqueue.default_startup_delay_sec * 1000,
            now_ms,
        )
        .await?;
    tracing::info!(delay_ms, "first tick scheduled");

    let app = build_router(AppState { rotation, poll, ds }).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.bind_addr, config.server.port);
    tracing::info!(%addr, "pulsefm-control listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
