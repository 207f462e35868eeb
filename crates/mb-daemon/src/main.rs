//! mb-daemon entry point.
//!
//! Loads config, connects to Postgres, builds the pipeline context, then runs
//! queue workers, the leader-elected schedulers and the status HTTP server
//! until Ctrl-C. Route handlers live in `routes.rs`; process wiring lives in
//! `wiring.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::Method;
use mb_daemon::{routes, state, wiring};
use mb_db::{PgStore, Store};
use mb_pipeline::HttpIdentityResolver;
use mb_queue::{JobQueue, PgJobQueue};
use mb_runtime::LeaderElection;
use tokio::sync::watch;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};

/// Comma-separated list of YAML files, merged left to right.
const ENV_CONFIG_PATHS: &str = "MB_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let loaded = load_config()?;
    let settings = Arc::new(loaded.settings()?);
    info!(config_hash = %loaded.config_hash, debug = settings.debug, "config loaded");

    let pool = mb_db::connect_from_env(
        &settings.database.url_env,
        settings.database.max_connections,
    )
    .await?;
    mb_db::migrate(&pool).await?;

    // Fatal: no component can identify without the service.
    let resolver = HttpIdentityResolver::from_settings(&settings.identify)
        .context("identity service is not configured")?;

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let pg_queue = PgJobQueue::new(pool, settings.queues.redelivery.clone());
    let backend: Arc<dyn JobQueue> = Arc::new(pg_queue.clone());
    let ctx = wiring::build_context(settings.clone(), store.clone(), backend, Arc::new(resolver))?;

    let owner = wiring::process_owner();
    let leader = Arc::new(LeaderElection::new(
        store.clone(),
        owner.clone(),
        Duration::from_secs(settings.scheduler.lock_ttl_secs),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = wiring::spawn_workers(&ctx, &owner, &shutdown_rx);
    tasks.extend(wiring::spawn_schedulers(&ctx, leader.clone(), &shutdown_rx)?);
    tasks.push(wiring::spawn_claim_recovery(
        pg_queue,
        Duration::from_secs(60),
        shutdown_rx.clone(),
    ));
    info!(owner = %owner, tasks = tasks.len(), "pipeline started");

    let shared = Arc::new(state::AppState::new(
        loaded.config_hash.clone(),
        store,
        ctx.queues.clone(),
        leader,
    ));
    let app = routes::build_router(shared)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::new().allow_methods([Method::GET]));

    let addr: SocketAddr = settings
        .http
        .bind_addr
        .parse()
        .with_context(|| format!("invalid http.bind_addr '{}'", settings.http.bind_addr))?;
    info!("mb-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server crashed")?;

    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %format!("{e:#}"), "task exited with error"),
            Err(e) => error!(error = %e, "task panicked"),
        }
    }
    info!("mb-daemon stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Layered YAML from `MB_CONFIG`, or built-in defaults when unset.
fn load_config() -> anyhow::Result<mb_config::LoadedConfig> {
    match std::env::var(ENV_CONFIG_PATHS) {
        Ok(raw) if !raw.trim().is_empty() => {
            let paths: Vec<&str> = raw.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
            mb_config::load_layered_yaml(&paths)
        }
        _ => mb_config::load_layered_yaml_from_strings(&["{}"]),
    }
}

/// Resolve on Ctrl-C and tell every worker and scheduler to stop.
async fn shutdown_signal(tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "ctrl-c handler failed; shutting down");
    }
    info!("shutdown requested");
    let _ = tx.send(true);
}
