//! Routing core entrypoint: `router serve` runs the Ingress API plus the
//! Forwarder Loop; `router provision` registers a new device credential
//! against an existing Queue Store database without starting a server.
//!
//! Tracing-subscriber setup, axum wiring, and graceful shutdown, with a
//! layered `Config` load and startup seeding of the durable replay log
//! and device credentials.

use clap::{Parser, Subcommand};
use relaycore::auth::{self, DeviceCredentialStore};
use relaycore::config::Config;
use relaycore::ids::IdsEngine;
use relaycore::metrics::Metrics;
use relaycore::queue::QueueStore;
use relaycore::ratelimit::SlidingWindowLimiter;
use relaycore::state::AppState;
use relaycore::{api, forwarder};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::info;

#[derive(Parser)]
#[command(name = "router", about = "Mesh relay store-and-forward routing core")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the Ingress API and Forwarder Loop (default if no subcommand given).
    Serve,
    /// Provision a new device credential and print its one-time plaintext token.
    Provision {
        /// Fingerprint the device will present in the X-Device-Fp header.
        device_fp: String,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "relaycore=info,tower_http=info".into()),
        )
        .json()
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(serve())
        }
        Command::Provision { device_fp } => provision(&device_fp),
    }
}

/// Registers `device_fp` against the configured Queue Store database
/// and prints the plaintext token once. The hash alone is persisted.
fn provision(device_fp: &str) -> anyhow::Result<()> {
    let cfg = Config::load()?;
    let store = QueueStore::open(&cfg.db_path, cfg.max_queue_size)?;
    let devices = DeviceCredentialStore::new();
    let token = devices.provision(device_fp);
    let cred_hash = auth::hash_token(&token);
    store.register_device(device_fp, &cred_hash)?;
    println!("device_fp: {device_fp}");
    println!("token:     {token}");
    println!("(store this token now — it is not recoverable from the database)");
    Ok(())
}

async fn serve() -> anyhow::Result<()> {
    let cfg = Config::load()?;
    info!(port = cfg.port, debug_mode = cfg.debug_mode, "starting relaycore");

    let queue = Arc::new(QueueStore::open(&cfg.db_path, cfg.max_queue_size)?);

    let ids = Arc::new(IdsEngine::new(cfg.ids.clone(), cfg.ids_log_path.clone()));
    for (msg_id, seen_at) in queue.load_replay_log()? {
        ids.remember_seen(&msg_id, seen_at as u64);
    }

    let devices = Arc::new(DeviceCredentialStore::new());
    for (device_fp, token_hash) in queue.load_devices()? {
        devices.register_hashed(device_fp, token_hash);
    }

    let metrics = Arc::new(Metrics::new());
    let auth_limiter = Arc::new(SlidingWindowLimiter::new(
        cfg.auth_rate_limit.window_seconds,
        cfg.auth_rate_limit.max_attempts_per_window,
    ));

    let state = AppState {
        config: Arc::new(cfg.clone()),
        queue: queue.clone(),
        ids,
        devices,
        metrics: metrics.clone(),
        auth_limiter,
    };

    let replay_prune_queue = queue.clone();
    let replay_ttl = cfg.ids.duplicate_suppression_ttl as i64;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let cutoff = chrono::Utc::now().timestamp() - replay_ttl;
            if let Err(e) = replay_prune_queue.prune_replay_log(cutoff) {
                tracing::warn!(error = %e, "failed to prune replay log");
            }
        }
    });

    let forwarder_handle = if cfg.forwarding_enabled {
        let client = reqwest::Client::builder()
            .timeout(cfg.send_timeout())
            .build()?;
        let forwarder_cfg = forwarder::ForwarderConfig {
            interval: cfg.forwarder_interval(),
            max_retries: cfg.max_retries,
            max_ttl: cfg.max_ttl,
            base_backoff_ms: cfg.base_retry_backoff_ms,
            ble_send_url: format!("{}/v1/ble/send_chunk", cfg.ble_base_url),
            send_timeout: cfg.send_timeout(),
        };
        Some(forwarder::spawn(
            queue.clone(),
            client,
            forwarder_cfg,
            metrics.clone(),
        ))
    } else {
        info!("forwarding disabled by config, running ingress-only");
        None
    };

    let app = api::router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive()),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received");
    })
    .await?;

    if let Some(handle) = forwarder_handle {
        handle.abort();
    }
    Ok(())
}
