//! Atelier server binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use atelier::config::AppConfig;
use atelier::credentials::{CredentialStore, EncodingProtector};
use atelier::events::EventHub;
use atelier::orchestrator::Orchestrator;
use atelier::provider::http::HttpBackend;
use atelier::provider::router::ProviderRouter;
use atelier::resilience::RetryPolicy;
use atelier::server::{build_router, AppState, RateLimiter};
use atelier::state::SessionStore;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Database path (overrides persistence.connection_string).
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("atelier=info".parse().expect("valid directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;

    let store = if config.persistence.enabled {
        let path = args
            .db
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.persistence.connection_string));
        tracing::info!(path = %path.display(), "Opening session store");
        SessionStore::open(&path).context("opening session store")?
    } else {
        tracing::warn!("Persistence disabled; state lives in memory only");
        SessionStore::open_in_memory().context("opening in-memory store")?
    }
    .shared();

    let credentials =
        CredentialStore::new(store.clone(), Arc::new(EncodingProtector)).shared();
    let backend =
        Arc::new(HttpBackend::new(config.request_timeout()).context("building HTTP backend")?);
    let router = ProviderRouter::new(
        credentials.clone(),
        backend,
        RetryPolicy::new(config.max_retries, Duration::from_millis(500)),
    )
    .shared();
    let hub = EventHub::new(config.event_buffer).shared();
    let orchestrator = Orchestrator::new(
        store.clone(),
        credentials.clone(),
        router,
        hub.clone(),
        config.orchestration.clone(),
    )
    .shared();

    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit.permit_limit,
        Duration::from_secs(config.rate_limit.window_seconds),
    ));

    let state = AppState {
        store,
        credentials,
        orchestrator,
        hub,
        config: Arc::new(config),
        limiter,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    tracing::info!(addr = %args.bind, "Atelier listening");
    axum::serve(listener, app).await.context("serving HTTP")?;

    Ok(())
}
