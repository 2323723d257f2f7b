//! Shared test builders.

use alloy::primitives::{address, Address, U256};
use async_trait::async_trait;
use lendscope_chain::math::pow10;
use lendscope_chain::{
    Asset, FetchBatch, MarketId, MarketParams, Position, PriceQuote, Protocol, ProtocolAdapter,
    SourceError,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const OWNER: Address = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
pub const OTHER_OWNER: Address = address!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");

/// Quote timestamp used by every test price.
pub const NOW: u64 = 1_700_000_000;

pub fn usdc() -> Asset {
    Asset::new("USDC", 6, Address::repeat_byte(0x11))
}

pub fn weth() -> Asset {
    Asset::new("WETH", 18, Address::repeat_byte(0x22))
}

/// Whole tokens to base units.
pub fn units(asset: &Asset, tokens: u64) -> U256 {
    U256::from(tokens) * pow10(asset.decimals)
}

/// Collateral-enabled position of `OWNER`, balances in whole tokens.
/// All positions of one protocol share the `<protocol>:pool` domain.
pub fn position(
    protocol: Protocol,
    market: &str,
    asset: Asset,
    supply: u64,
    borrow: u64,
    liquidation_threshold: f64,
) -> Position {
    Position {
        owner: OWNER,
        protocol,
        market_id: MarketId::new(market),
        supply_balance: units(&asset, supply),
        borrow_balance: units(&asset, borrow),
        asset,
        is_collateral_enabled: true,
        current_supply_apy: 0.03,
        current_borrow_apy: 0.05,
        liquidation_threshold,
        margin_domain: format!("{protocol}:pool"),
    }
}

/// Price table keyed by asset address.
pub fn prices(entries: &[(Asset, f64)]) -> HashMap<Address, PriceQuote> {
    entries
        .iter()
        .map(|(asset, usd)| {
            let quote = PriceQuote::from_usd(*usd, NOW).expect("test price must be positive");
            (asset.address, quote)
        })
        .collect()
}

/// Open market with deep liquidity.
pub fn market(protocol: Protocol, id: &str, asset: Asset, supply_apy: f64, borrow_apy: f64) -> MarketParams {
    MarketParams {
        protocol,
        market_id: MarketId::new(id),
        available_liquidity: units(&asset, 1_000_000),
        asset,
        loan_token: None,
        collateral_token: None,
        liquidation_threshold: 0.8,
        max_ltv: 0.75,
        supply_apy,
        borrow_apy,
        fee_apy: 0.0,
        can_supply: true,
        can_borrow: true,
        margin_domain: format!("{protocol}:{id}"),
    }
}

/// In-memory adapter whose answers tests rewrite between polls.
#[derive(Debug)]
pub struct ScriptedAdapter {
    protocol: Protocol,
    markets: Mutex<Vec<MarketParams>>,
    positions: Mutex<HashMap<Address, Result<Vec<Position>, SourceError>>>,
    delay: Mutex<Option<Duration>>,
    pub calls: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            markets: Mutex::new(Vec::new()),
            positions: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_markets(&self, markets: Vec<MarketParams>) {
        *self.markets.lock() = markets;
    }

    pub fn set_positions(&self, owner: Address, positions: Vec<Position>) {
        self.positions.lock().insert(owner, Ok(positions));
    }

    pub fn fail(&self, owner: Address, error: SourceError) {
        self.positions.lock().insert(owner, Err(error));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    async fn pause(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ProtocolAdapter for ScriptedAdapter {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn fetch_markets(&self) -> Result<FetchBatch<MarketParams>, SourceError> {
        self.pause().await;
        let mut batch = FetchBatch::new();
        batch.items = self.markets.lock().clone();
        Ok(batch)
    }

    async fn fetch_positions(&self, owner: Address) -> Result<FetchBatch<Position>, SourceError> {
        self.pause().await;
        let answer = self.positions.lock().get(&owner).cloned();
        let mut batch = FetchBatch::new();
        match answer {
            Some(Ok(positions)) => batch.items = positions,
            Some(Err(e)) => return Err(e),
            None => {}
        }
        Ok(batch)
    }
}
