//! Compound III (Comet) adapter.
//!
//! A Comet lends a single base asset against a set of collateral assets.
//! The base asset becomes market `<comet>` (never collateral) and every
//! collateral asset becomes a supply-only market `<comet>/<asset>`. All of
//! them share the Comet's margin domain.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{
    index_markets, translate_markets, unknown_market, ChainDataSource, CometMarket, FetchBatch,
    MarketId, MarketParams, Position, Protocol, ProtocolAdapter, RawAccount, RawMarket,
    SourceError,
};
use crate::math::{mantissa_to_fraction, per_second_rate_to_apy};

/// Adapter for Compound III deployments.
#[derive(Debug, Clone)]
pub struct CompoundV3Adapter {
    source: Arc<dyn ChainDataSource>,
}

impl CompoundV3Adapter {
    /// Create a new adapter reading from `source`.
    pub fn new(source: Arc<dyn ChainDataSource>) -> Self {
        Self { source }
    }

    fn base_market_id(comet: &Address) -> MarketId {
        MarketId::new(comet.to_string())
    }

    fn collateral_market_id(comet: &Address, asset: &Address) -> MarketId {
        MarketId::new(format!("{comet}/{asset}"))
    }

    fn translate(market: CometMarket) -> Vec<MarketParams> {
        let domain = format!("compound:{}", market.comet);
        let mut out = Vec::with_capacity(market.collaterals.len() + 1);

        out.push(MarketParams {
            protocol: Protocol::Compound,
            market_id: Self::base_market_id(&market.comet),
            asset: market.base.clone(),
            loan_token: None,
            collateral_token: None,
            // The base asset never counts as collateral
            liquidation_threshold: 0.0,
            max_ltv: 0.0,
            supply_apy: per_second_rate_to_apy(market.supply_rate_per_second),
            borrow_apy: per_second_rate_to_apy(market.borrow_rate_per_second),
            fee_apy: 0.0,
            available_liquidity: market.total_supply.saturating_sub(market.total_borrow),
            can_supply: !market.is_supply_paused,
            can_borrow: !market.is_withdraw_paused,
            margin_domain: domain.clone(),
        });

        for collateral in market.collaterals {
            let headroom = collateral.supply_cap.saturating_sub(collateral.total_supply);
            out.push(MarketParams {
                protocol: Protocol::Compound,
                market_id: Self::collateral_market_id(&market.comet, &collateral.asset.address),
                asset: collateral.asset,
                loan_token: Some(market.base.clone()),
                collateral_token: None,
                liquidation_threshold: mantissa_to_fraction(collateral.liquidate_collateral_factor),
                max_ltv: mantissa_to_fraction(collateral.borrow_collateral_factor),
                supply_apy: 0.0,
                borrow_apy: 0.0,
                fee_apy: 0.0,
                available_liquidity: headroom,
                can_supply: !market.is_supply_paused && !headroom.is_zero(),
                can_borrow: false,
                margin_domain: domain.clone(),
            });
        }

        out
    }
}

#[async_trait]
impl ProtocolAdapter for CompoundV3Adapter {
    fn protocol(&self) -> Protocol {
        Protocol::Compound
    }

    #[instrument(skip(self))]
    async fn fetch_markets(&self) -> Result<FetchBatch<MarketParams>, SourceError> {
        let entries = self.source.fetch_markets(Protocol::Compound).await?;
        let batch = translate_markets(Protocol::Compound, entries, |raw| match raw {
            RawMarket::Compound(market) => Ok(Self::translate(market)),
            other => Err((
                other.protocol().to_string(),
                SourceError::Malformed("expected a comet market".into()),
            )),
        });

        debug!(
            markets = batch.items.len(),
            failures = batch.failures.len(),
            "Translated comet markets"
        );
        Ok(batch)
    }

    #[instrument(skip(self), fields(owner = %owner))]
    async fn fetch_positions(&self, owner: Address) -> Result<FetchBatch<Position>, SourceError> {
        let (markets, account) = tokio::try_join!(
            self.fetch_markets(),
            self.source.fetch_account(Protocol::Compound, owner)
        )?;

        let positions = match account {
            RawAccount::Compound { positions } => positions,
            other => {
                return Err(SourceError::Malformed(format!(
                    "expected comet account, got {}",
                    other.protocol()
                )))
            }
        };

        let index = index_markets(&markets.items);
        let mut batch = FetchBatch::new();

        for raw in positions {
            // Comet nets base supply against base debt; only one side is ever non-zero
            if !raw.base_supply.is_zero() || !raw.base_borrow.is_zero() {
                let id = Self::base_market_id(&raw.comet);
                match index.get(&id) {
                    Some(market) => batch.items.push(Position::in_market(
                        market,
                        owner,
                        raw.base_supply,
                        raw.base_borrow,
                        false,
                    )),
                    None => batch.fail(Protocol::Compound, id.to_string(), unknown_market(&id)),
                }
            }

            for collateral in raw.collaterals.iter().filter(|c| !c.balance.is_zero()) {
                let id = Self::collateral_market_id(&raw.comet, &collateral.asset);
                match index.get(&id) {
                    Some(market) => batch.items.push(Position::in_market(
                        market,
                        owner,
                        collateral.balance,
                        U256::ZERO,
                        true,
                    )),
                    None => batch.fail(Protocol::Compound, id.to_string(), unknown_market(&id)),
                }
            }
        }

        debug!(positions = batch.items.len(), "Translated comet account");
        Ok(batch)
    }
}
