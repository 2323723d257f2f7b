//! Morpho Blue adapter.
//!
//! Each Morpho market is an isolated (loan token, collateral token, LLTV)
//! triple. It is exposed as two common-schema markets sharing one margin
//! domain: the lending side `<id>` and the collateral side `<id>/collateral`.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{
    index_markets, translate_markets, unknown_market, ChainDataSource, FetchBatch, MarketId,
    MarketParams, MorphoMarket, Position, Protocol, ProtocolAdapter, RawAccount, RawMarket,
    SourceError,
};
use crate::math::{mantissa_to_fraction, per_second_rate_to_apy, wad_div};

const COLLATERAL_SUFFIX: &str = "/collateral";

/// Adapter for Morpho Blue isolated markets.
#[derive(Debug, Clone)]
pub struct MorphoBlueAdapter {
    source: Arc<dyn ChainDataSource>,
}

impl MorphoBlueAdapter {
    /// Create a new adapter reading from `source`.
    pub fn new(source: Arc<dyn ChainDataSource>) -> Self {
        Self { source }
    }

    fn loan_market_id(id: &str) -> MarketId {
        MarketId::new(id)
    }

    fn collateral_market_id(id: &str) -> MarketId {
        MarketId::new(format!("{id}{COLLATERAL_SUFFIX}"))
    }

    fn translate(market: MorphoMarket) -> Result<Vec<MarketParams>, (String, SourceError)> {
        let fee = mantissa_to_fraction(market.fee);
        if !(0.0..=1.0).contains(&fee) {
            return Err((
                market.id.clone(),
                SourceError::Malformed(format!("fee outside [0, 1]: {fee}")),
            ));
        }

        let lltv = mantissa_to_fraction(market.lltv);
        let utilization = if market.total_supply_assets.is_zero() {
            0.0
        } else {
            mantissa_to_fraction(wad_div(market.total_borrow_assets, market.total_supply_assets))
                .min(1.0)
        };

        let borrow_apy = per_second_rate_to_apy(market.borrow_rate_per_second);
        let supply_apy = borrow_apy * utilization;
        let domain = format!("morpho:{}", market.id);

        let lending = MarketParams {
            protocol: Protocol::Morpho,
            market_id: Self::loan_market_id(&market.id),
            asset: market.loan_token.clone(),
            loan_token: Some(market.loan_token.clone()),
            collateral_token: Some(market.collateral_token.clone()),
            liquidation_threshold: lltv,
            max_ltv: lltv,
            supply_apy,
            borrow_apy,
            fee_apy: supply_apy * fee,
            available_liquidity: market
                .total_supply_assets
                .saturating_sub(market.total_borrow_assets),
            can_supply: true,
            can_borrow: true,
            margin_domain: domain.clone(),
        };

        // Collateral earns nothing and is never lent out
        let collateral = MarketParams {
            protocol: Protocol::Morpho,
            market_id: Self::collateral_market_id(&market.id),
            asset: market.collateral_token.clone(),
            loan_token: Some(market.loan_token),
            collateral_token: Some(market.collateral_token),
            liquidation_threshold: lltv,
            max_ltv: lltv,
            supply_apy: 0.0,
            borrow_apy: 0.0,
            fee_apy: 0.0,
            available_liquidity: U256::MAX,
            can_supply: true,
            can_borrow: false,
            margin_domain: domain,
        };

        Ok(vec![lending, collateral])
    }
}

#[async_trait]
impl ProtocolAdapter for MorphoBlueAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Morpho
    }

    #[instrument(skip(self))]
    async fn fetch_markets(&self) -> Result<FetchBatch<MarketParams>, SourceError> {
        let entries = self.source.fetch_markets(Protocol::Morpho).await?;
        let batch = translate_markets(Protocol::Morpho, entries, |raw| match raw {
            RawMarket::Morpho(market) => Self::translate(market),
            other => Err((
                other.protocol().to_string(),
                SourceError::Malformed("expected a morpho market".into()),
            )),
        });

        debug!(
            markets = batch.items.len(),
            failures = batch.failures.len(),
            "Translated morpho markets"
        );
        Ok(batch)
    }

    #[instrument(skip(self), fields(owner = %owner))]
    async fn fetch_positions(&self, owner: Address) -> Result<FetchBatch<Position>, SourceError> {
        let (markets, account) = tokio::try_join!(
            self.fetch_markets(),
            self.source.fetch_account(Protocol::Morpho, owner)
        )?;

        let positions = match account {
            RawAccount::Morpho { positions } => positions,
            other => {
                return Err(SourceError::Malformed(format!(
                    "expected morpho account, got {}",
                    other.protocol()
                )))
            }
        };

        let index = index_markets(&markets.items);
        let mut batch = FetchBatch::new();

        for raw in positions {
            if !raw.supply_assets.is_zero() || !raw.borrow_assets.is_zero() {
                let id = Self::loan_market_id(&raw.market_id);
                match index.get(&id) {
                    Some(market) => batch.items.push(Position::in_market(
                        market,
                        owner,
                        raw.supply_assets,
                        raw.borrow_assets,
                        false,
                    )),
                    None => batch.fail(Protocol::Morpho, id.to_string(), unknown_market(&id)),
                }
            }

            if !raw.collateral.is_zero() {
                let id = Self::collateral_market_id(&raw.market_id);
                match index.get(&id) {
                    Some(market) => batch.items.push(Position::in_market(
                        market,
                        owner,
                        raw.collateral,
                        U256::ZERO,
                        true,
                    )),
                    None => batch.fail(Protocol::Morpho, id.to_string(), unknown_market(&id)),
                }
            }
        }

        debug!(positions = batch.items.len(), "Translated morpho account");
        Ok(batch)
    }
}
