//! Lendscope risk monitor
//!
//! Watches lending positions and reports liquidation risk. Positions come
//! from the Morpho Blue API; Aave V3, Compound III and Moonwell adapters
//! plug in through any `ChainDataSource`.
//! Features:
//! - Periodic position refresh with bounded fan-out
//! - Health factors evaluated per margin domain against live prices
//! - Tier-transition alerts with recovery hysteresis

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lendscope_api::{DefiLlamaClient, MorphoApiClient};
use lendscope_chain::protocol::MorphoBlueAdapter;
use lendscope_chain::{AdapterSet, CancelHandle, CancelSignal, ChainDataSource, PriceBook, PriceLookup};
use lendscope_core::{EngineConfig, LendingEngine, LiquidationMonitor, TracingAlertSink};

/// Environment variable names.
mod env {
    pub const TRACKED_OWNERS: &str = "TRACKED_OWNERS";
    pub const PRICE_CHAIN: &str = "PRICE_CHAIN";
    pub const PRICE_ASSETS: &str = "PRICE_ASSETS";
    pub const MORPHO_CHAIN_ID: &str = "MORPHO_CHAIN_ID";
}

#[tokio::main]
async fn main() -> Result<()> {
    // Print startup banner
    print_banner();

    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lendscope_core=debug,lendscope_chain=debug")),
        )
        .init();

    // ENGINE_PROFILE selects: default, conservative, relaxed, or a TOML path
    let engine_config = EngineConfig::from_env()?;
    engine_config.log_config();

    let config = load_config()?;
    info!(
        owners = config.owners.len(),
        price_chain = %config.price_chain,
        morpho_chain_id = config.morpho_chain_id,
        "Starting Lendscope risk monitor"
    );

    // Position sources
    let morpho: Arc<dyn ChainDataSource> = Arc::new(MorphoApiClient::new(config.morpho_chain_id));
    let adapters = AdapterSet::new(engine_config.fetch)
        .with_adapter(Arc::new(MorphoBlueAdapter::new(morpho)));
    info!(protocols = ?adapters.protocols(), "Adapters registered");

    let (cancel, signal) = CancelHandle::new();

    // Prices for every market asset plus PRICE_ASSETS
    let feed = Arc::new(DefiLlamaClient::new(&config.price_chain).with_search_width("4h"));
    let book = Arc::new(PriceBook::new(engine_config.prices.max_staleness_secs));
    let assets = price_assets(&adapters, &config.price_assets, &signal).await;
    info!(assets = assets.len(), "Price assets resolved");
    if let Err(e) = book.refresh_from(feed.as_ref(), &assets).await {
        warn!(error = %e, "Initial price refresh failed");
    }

    let prices: Arc<dyn PriceLookup> = book.clone();

    // Startup snapshot
    let engine = LendingEngine::new(adapters.clone(), prices.clone(), engine_config.routing.clone());
    for owner in &config.owners {
        match engine.portfolio_stats(*owner, &signal).await {
            Ok(stats) => info!(
                owner = %owner,
                supply_usd = stats.total_supply_usd,
                borrow_usd = stats.total_borrow_usd,
                lowest_hf = stats.lowest_health_factor,
                unpriced = stats.unpriced.len(),
                "Portfolio snapshot"
            ),
            Err(e) => warn!(owner = %owner, error = %e, "Portfolio snapshot unavailable"),
        }
    }

    // Price refresher
    let refresh_every = engine_config.monitor.poll_interval();
    let price_task = tokio::spawn(refresh_prices(
        feed,
        book,
        adapters.clone(),
        config.price_assets.clone(),
        refresh_every,
        signal.clone(),
    ));

    // Monitor
    let mut monitor = LiquidationMonitor::new(
        adapters,
        prices,
        Arc::new(TracingAlertSink),
        engine_config.monitor.clone(),
    );
    for owner in &config.owners {
        monitor.track(*owner);
    }
    let monitor_task = tokio::spawn(monitor.run(signal));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("Shutdown requested");
    cancel.cancel();

    let _ = tokio::join!(monitor_task, price_task);
    info!("Stopped");

    Ok(())
}

/// Configuration loaded from environment.
struct Config {
    owners: Vec<Address>,
    price_chain: String,
    price_assets: Vec<Address>,
    morpho_chain_id: u64,
}

fn load_config() -> Result<Config> {
    let get_env = |name: &str| -> Result<String> {
        std::env::var(name).map_err(|_| anyhow::anyhow!("Missing env var: {}", name))
    };

    let get_addresses = |name: &str| -> Result<Vec<Address>> {
        let raw = get_env(name)?;
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse()
                    .map_err(|e| anyhow::anyhow!("Invalid address in {}: {} ({})", name, s, e))
            })
            .collect()
    };

    let morpho_chain_id = match std::env::var(env::MORPHO_CHAIN_ID) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("Invalid {}: {}", env::MORPHO_CHAIN_ID, value))?,
        Err(_) => 1,
    };

    Ok(Config {
        owners: get_addresses(env::TRACKED_OWNERS)?,
        price_chain: get_env(env::PRICE_CHAIN).unwrap_or_else(|_| "ethereum".to_string()),
        price_assets: get_addresses(env::PRICE_ASSETS).unwrap_or_default(),
        morpho_chain_id,
    })
}

/// Assets of every market the adapters list, plus the configured extras.
///
/// A failed market refresh falls back to whatever could be listed.
async fn price_assets(adapters: &AdapterSet, extra: &[Address], cancel: &CancelSignal) -> Vec<Address> {
    let mut assets: BTreeSet<Address> = extra.iter().copied().collect();

    match adapters.refresh_markets(cancel).await {
        Ok(sweep) => {
            if !sweep.is_complete() {
                warn!(problems = ?sweep.problems(), "Some markets could not be listed for pricing");
            }
            assets.extend(sweep.assets());
        }
        Err(e) => warn!(error = %e, "Market listing failed, pricing configured assets only"),
    }

    assets.into_iter().collect()
}

/// Keep the price book fresh until cancelled.
async fn refresh_prices(
    feed: Arc<DefiLlamaClient>,
    book: Arc<PriceBook>,
    adapters: AdapterSet,
    extra: Vec<Address>,
    every: Duration,
    cancel: CancelSignal,
) {
    let mut ticker = tokio::time::interval(every);
    // The first tick fires immediately; startup already refreshed.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let assets = price_assets(&adapters, &extra, &cancel).await;
        if let Err(e) = book.refresh_from(feed.as_ref(), &assets).await {
            warn!(error = %e, "Price refresh failed");
        }

        let stale = book.stale_assets(unix_now());
        if !stale.is_empty() {
            warn!(stale = stale.len(), "Assets without a fresh price");
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Print startup banner.
fn print_banner() {
    println!(r#"
    ╦  ┌─┐┌┐┌┌┬┐┌─┐┌─┐┌─┐┌─┐┌─┐
    ║  ├┤ │││ ││└─┐│  │ │├─┘├┤
    ╩═╝└─┘┘└┘─┴┘└─┘└─┘└─┘┴  └─┘
    Lending Risk Monitor v0.1.0
    "#);
}
