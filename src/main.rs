// =============================================================================
// Replay Exchange — Main Entry Point
// =============================================================================

use std::sync::Arc;

use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use replay_exchange::app_state::AppState;
use replay_exchange::market_data::throttle::Throttle;
use replay_exchange::market_data::vendor::VendorClient;
use replay_exchange::persistence::Database;
use replay_exchange::runtime_config::RuntimeConfig;

const CONFIG_PATH: &str = "replay_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Replay Exchange — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    info!(
        bind_addr = %config.bind_addr,
        database = %config.database_path,
        vendor = %config.vendor_base_url,
        "configuration resolved"
    );

    // ── 2. Persistence ───────────────────────────────────────────────────
    let db = Database::open(&config.database_path)?;

    // ── 3. Vendor client (with process-wide throttle) ────────────────────
    let throttle = Arc::new(Throttle::new(Duration::from_millis(
        config.vendor_request_spacing_ms,
    )));
    let vendor = Arc::new(VendorClient::new(config.vendor_base_url.clone(), throttle));

    // ── 4. Shared state & server ─────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config, db, vendor));

    let app = replay_exchange::api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "server listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "server failed");
        }
    });

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping");

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Replay Exchange shut down complete.");
    Ok(())
}
