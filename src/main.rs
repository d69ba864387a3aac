// =============================================================================
// Lattice Grid Engine — Main Entry Point
// =============================================================================
//
// The engine starts in dry-run mode against the sim broker unless LATTICE_MODE
// is explicitly "live". Live mode without API credentials is a fatal startup
// error.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod account;
mod advantage;
mod api;
mod audit;
mod config;
mod derisk;
mod engine;
mod execution;
mod grid;
mod inventory;
mod market_data;
mod orders;
mod risk;
mod skew;
mod snapshot;
mod state;
mod state_machine;
mod types;
mod volatility;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::audit::{AuditEvent, AuditJournal};
use crate::config::EngineConfig;
use crate::engine::{Engine, EngineEvent};
use crate::execution::{Broker, LiveBroker, SimBroker};
use crate::types::{session_id_at, MarketType, RunMode};

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Lattice Grid Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Config: file + env overrides ──────────────────────────────────
    let config_path =
        std::env::var("LATTICE_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let mut config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });
    apply_env_overrides(&mut config)?;

    let run_mode = match std::env::var("LATTICE_MODE").as_deref() {
        Ok("live") => RunMode::Live,
        _ => RunMode::DryRun,
    };

    let started_at = Utc::now();
    let session_id = session_id_at(started_at);
    let output_dir = std::env::var("LATTICE_OUTPUT_DIR")
        .unwrap_or_else(|_| format!("output/{session_id}"));
    let mut journal = AuditJournal::open(&output_dir)?;

    // ── 3. Validation: invariants, ranges, dangerous combos ──────────────
    let validation = config::validator::validate(&config);
    if !validation.is_valid() {
        let event = AuditEvent::config_invalid(
            &session_id,
            started_at,
            &config.hash(),
            &validation.violations,
        );
        journal.write(&event)?;
        for violation in &validation.violations {
            error!(violation = %violation, "config rejected");
        }
        bail!("config validation failed: {:?}", validation.violations);
    }

    // ── 4. Session artifacts ─────────────────────────────────────────────
    config.save_snapshot(format!("{output_dir}/config_snapshot.yaml"))?;

    info!(
        session_id = %session_id,
        config_hash = %config.hash(),
        symbol = %config.trader.symbol,
        run_mode = %run_mode,
        outer_range_low = config.trader.outer_range_low,
        outer_range_high = config.trader.outer_range_high,
        leverage = config.trader.leverage,
        "session configured"
    );

    // ── 5. Broker selection ──────────────────────────────────────────────
    let broker = match run_mode {
        RunMode::DryRun => {
            info!("dry-run: orders route to the sim broker against the live feed");
            Broker::Sim(SimBroker::new(&config.sim, &config.fees))
        }
        RunMode::Live => {
            let api_key = std::env::var("BITGET_API_KEY").unwrap_or_default();
            let secret = std::env::var("BITGET_API_SECRET").unwrap_or_default();
            let passphrase = std::env::var("BITGET_API_PASSPHRASE").unwrap_or_default();
            if api_key.is_empty() || secret.is_empty() || passphrase.is_empty() {
                bail!("live mode requires BITGET_API_KEY / BITGET_API_SECRET / BITGET_API_PASSPHRASE");
            }
            Broker::Live(LiveBroker::new(api_key, secret, passphrase))
        }
    };

    // ── 6. Engine ────────────────────────────────────────────────────────
    info!(
        sim = broker.is_sim(),
        supports_reduce_only = broker.supports_reduce_only(),
        "execution adapter ready"
    );

    let mut engine = Engine::new(config.clone(), broker, journal, session_id.clone(), started_at);
    engine.initialize(started_at)?;
    let status = engine.status_handle();

    let (tx, rx) = mpsc::unbounded_channel::<EngineEvent>();

    // ── 7. Market data feed ──────────────────────────────────────────────
    {
        let symbol = config.trader.symbol.clone();
        let bar_tf = config.grid.bar_tf.clone();
        let feed_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    market_data::feed::run_market_feed(&symbol, &bar_tf, feed_tx.clone()).await
                {
                    error!(symbol = %symbol, error = %e, "market feed error — reconnecting in 5s");
                }
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        });
    }

    // ── 8. Live account reconciliation ───────────────────────────────────
    if run_mode == RunMode::Live {
        let api_key = std::env::var("BITGET_API_KEY").unwrap_or_default();
        let secret = std::env::var("BITGET_API_SECRET").unwrap_or_default();
        let passphrase = std::env::var("BITGET_API_PASSPHRASE").unwrap_or_default();
        let recon = LiveBroker::new(api_key, secret, passphrase);
        let symbol = config.trader.symbol.clone();
        let recon_tx = tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                match recon.get_account(&symbol).await {
                    Ok((equity, available, locked, margin_ratio, liq_price)) => {
                        let _ = recon_tx.send(EngineEvent::AccountUpdate {
                            equity,
                            available,
                            margin_used: locked,
                            margin_ratio,
                            liq_price,
                        });
                    }
                    Err(e) => warn!(error = %e, "account reconciliation failed"),
                }
            }
        });
    }

    // ── 9. Operator API ──────────────────────────────────────────────────
    {
        let bind_addr = config.api.bind_addr.clone();
        let api_state = api::rest::ApiState {
            status: status.clone(),
            events: tx.clone(),
        };
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => {
                    info!(addr = %bind_addr, "operator API listening");
                    if let Err(e) = axum::serve(listener, app).await {
                        error!(error = %e, "operator API failed");
                    }
                }
                Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind operator API"),
            }
        });
    }

    // ── 10. Graceful shutdown on Ctrl+C ──────────────────────────────────
    {
        let shutdown_tx = tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("shutdown signal received — draining");
                let _ = shutdown_tx.send(EngineEvent::Shutdown);
            }
        });
    }

    info!("all subsystems running; press Ctrl+C to stop");
    engine.run(rx).await?;
    info!("Lattice Grid Engine shut down complete");
    Ok(())
}

/// Env-var overrides for the trader inputs the launch wrapper provides:
/// symbol, outer range, balance, leverage, market type.
fn apply_env_overrides(config: &mut EngineConfig) -> Result<()> {
    if let Ok(symbol) = std::env::var("LATTICE_SYMBOL") {
        if !symbol.trim().is_empty() {
            config.trader.symbol = symbol.trim().to_uppercase();
        }
    }
    if let Ok(low) = std::env::var("LATTICE_RANGE_LOW") {
        config.trader.outer_range_low = low
            .parse()
            .context("LATTICE_RANGE_LOW must be a number")?;
    }
    if let Ok(high) = std::env::var("LATTICE_RANGE_HIGH") {
        config.trader.outer_range_high = high
            .parse()
            .context("LATTICE_RANGE_HIGH must be a number")?;
    }
    if let Ok(balance) = std::env::var("LATTICE_BALANCE") {
        config.trader.initial_balance = balance
            .parse()
            .context("LATTICE_BALANCE must be a number")?;
    }
    if let Ok(leverage) = std::env::var("LATTICE_LEVERAGE") {
        config.trader.leverage = leverage
            .parse()
            .context("LATTICE_LEVERAGE must be a number")?;
    }
    if let Ok(market) = std::env::var("LATTICE_MARKET_TYPE") {
        config.trader.market_type = match market.to_lowercase().as_str() {
            "spot" => MarketType::Spot,
            "swap" => MarketType::Swap,
            other => bail!("LATTICE_MARKET_TYPE must be spot or swap, got {other}"),
        };
    }
    Ok(())
}
