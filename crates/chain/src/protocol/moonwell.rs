//! Moonwell adapter.
//!
//! Moonwell follows the Compound V2 model: one mToken per asset under a
//! comptroller, a single collateral factor per market, and cross-margin
//! over every market the account has entered.

use alloy::primitives::Address;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{
    index_markets, translate_markets, unknown_market, ChainDataSource, FetchBatch, MarketId,
    MarketParams, MoonwellMarket, Position, Protocol, ProtocolAdapter, RawAccount, RawMarket,
    SourceError,
};
use crate::math::{mantissa_to_fraction, per_second_rate_to_apy};

/// Adapter for Moonwell markets.
#[derive(Debug, Clone)]
pub struct MoonwellAdapter {
    source: Arc<dyn ChainDataSource>,
}

impl MoonwellAdapter {
    /// Create a new adapter reading from `source`.
    pub fn new(source: Arc<dyn ChainDataSource>) -> Self {
        Self { source }
    }

    fn market_id(m_token: &Address) -> MarketId {
        MarketId::new(m_token.to_string())
    }

    fn translate(market: MoonwellMarket) -> MarketParams {
        let collateral_factor = mantissa_to_fraction(market.collateral_factor);

        MarketParams {
            protocol: Protocol::Moonwell,
            market_id: Self::market_id(&market.m_token),
            asset: market.underlying,
            loan_token: None,
            collateral_token: None,
            liquidation_threshold: collateral_factor,
            max_ltv: collateral_factor,
            supply_apy: per_second_rate_to_apy(market.supply_rate_per_timestamp),
            borrow_apy: per_second_rate_to_apy(market.borrow_rate_per_timestamp),
            fee_apy: 0.0,
            available_liquidity: market.cash,
            can_supply: !market.mint_paused,
            can_borrow: !market.borrow_paused,
            margin_domain: format!("moonwell:{}", market.comptroller),
        }
    }
}

#[async_trait]
impl ProtocolAdapter for MoonwellAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Moonwell
    }

    #[instrument(skip(self))]
    async fn fetch_markets(&self) -> Result<FetchBatch<MarketParams>, SourceError> {
        let entries = self.source.fetch_markets(Protocol::Moonwell).await?;
        let batch = translate_markets(Protocol::Moonwell, entries, |raw| match raw {
            RawMarket::Moonwell(market) => Ok(vec![Self::translate(market)]),
            other => Err((
                other.protocol().to_string(),
                SourceError::Malformed("expected a moonwell market".into()),
            )),
        });

        debug!(
            markets = batch.items.len(),
            failures = batch.failures.len(),
            "Translated moonwell markets"
        );
        Ok(batch)
    }

    #[instrument(skip(self), fields(owner = %owner))]
    async fn fetch_positions(&self, owner: Address) -> Result<FetchBatch<Position>, SourceError> {
        let (markets, account) = tokio::try_join!(
            self.fetch_markets(),
            self.source.fetch_account(Protocol::Moonwell, owner)
        )?;

        let entries = match account {
            RawAccount::Moonwell { markets } => markets,
            other => {
                return Err(SourceError::Malformed(format!(
                    "expected moonwell account, got {}",
                    other.protocol()
                )))
            }
        };

        let index = index_markets(&markets.items);
        let mut batch = FetchBatch::new();

        for raw in entries {
            if raw.supply_underlying.is_zero() && raw.borrow_balance.is_zero() {
                continue;
            }

            let id = Self::market_id(&raw.m_token);
            let Some(market) = index.get(&id) else {
                batch.fail(Protocol::Moonwell, id.to_string(), unknown_market(&id));
                continue;
            };

            batch.items.push(Position::in_market(
                market,
                owner,
                raw.supply_underlying,
                raw.borrow_balance,
                raw.entered && market.liquidation_threshold > 0.0,
            ));
        }

        debug!(positions = batch.items.len(), "Translated moonwell account");
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::SECONDS_PER_YEAR;
    use crate::protocol::fixtures::{owner, usdc, wad, weth, MemorySource};
    use crate::protocol::{Asset, MoonwellUserMarket};
    use alloy::primitives::U256;
    use smallvec::smallvec;

    fn market(underlying: Asset, m_token: u8, cf: f64) -> MoonwellMarket {
        MoonwellMarket {
            comptroller: Address::repeat_byte(0xcc),
            m_token: Address::repeat_byte(m_token),
            underlying,
            collateral_factor: wad(cf),
            supply_rate_per_timestamp: wad(0.02 / SECONDS_PER_YEAR),
            borrow_rate_per_timestamp: wad(0.05 / SECONDS_PER_YEAR),
            cash: U256::from(5_000u64),
            mint_paused: false,
            borrow_paused: true,
        }
    }

    #[tokio::test]
    async fn test_collateral_factor_is_both_thresholds() {
        let source =
            MemorySource::default().with_market(RawMarket::Moonwell(market(weth(), 0x01, 0.78)));
        let batch = MoonwellAdapter::new(Arc::new(source))
            .fetch_markets()
            .await
            .unwrap();

        let m = &batch.items[0];
        assert!((m.liquidation_threshold - 0.78).abs() < 1e-12);
        assert_eq!(m.liquidation_threshold, m.max_ltv);
        assert_eq!(m.available_liquidity, U256::from(5_000u64));
        assert!(m.can_supply);
        assert!(!m.can_borrow);
    }

    #[tokio::test]
    async fn test_entered_markets_are_collateral() {
        let source = MemorySource::default()
            .with_market(RawMarket::Moonwell(market(weth(), 0x01, 0.78)))
            .with_market(RawMarket::Moonwell(market(usdc(), 0x02, 0.85)))
            .with_account(
                owner(),
                RawAccount::Moonwell {
                    markets: smallvec![
                        MoonwellUserMarket {
                            m_token: Address::repeat_byte(0x01),
                            supply_underlying: U256::from(3u64),
                            borrow_balance: U256::ZERO,
                            entered: true,
                        },
                        MoonwellUserMarket {
                            m_token: Address::repeat_byte(0x02),
                            supply_underlying: U256::from(9u64),
                            borrow_balance: U256::from(4u64),
                            entered: false,
                        },
                    ],
                },
            );

        let batch = MoonwellAdapter::new(Arc::new(source))
            .fetch_positions(owner())
            .await
            .unwrap();

        assert_eq!(batch.items.len(), 2);
        assert!(batch.items[0].is_collateral_enabled);
        assert!(!batch.items[1].is_collateral_enabled);
        assert_eq!(batch.items[0].margin_domain, batch.items[1].margin_domain);
    }
}
