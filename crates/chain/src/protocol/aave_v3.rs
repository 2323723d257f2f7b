//! AAVE V3 adapter.
//!
//! Reserves share one cross-margin account per pool: every supplied asset
//! with collateral enabled backs every borrow. Risk parameters arrive in
//! basis points and rates as ray-scaled APRs.

use alloy::primitives::Address;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{
    index_markets, translate_markets, unknown_market, AaveReserve, ChainDataSource, FetchBatch,
    MarketId, MarketParams, Position, Protocol, ProtocolAdapter, RawAccount, RawMarket,
    SourceError,
};
use crate::math::{apr_to_apy, bps_to_fraction, ray_to_fraction};

/// Adapter for AAVE V3 and compatible forks.
#[derive(Debug, Clone)]
pub struct AaveV3Adapter {
    source: Arc<dyn ChainDataSource>,
}

impl AaveV3Adapter {
    /// Create a new adapter reading from `source`.
    pub fn new(source: Arc<dyn ChainDataSource>) -> Self {
        Self { source }
    }

    /// Market id of a reserve: `<pool>/<asset>`. Pools listing the same
    /// asset stay distinct.
    fn market_id(pool: &Address, asset: &Address) -> MarketId {
        MarketId::new(format!("{pool}/{asset}"))
    }

    fn translate(reserve: AaveReserve) -> MarketParams {
        let liquidation_threshold = bps_to_fraction(reserve.liquidation_threshold_bps);
        let can_supply = reserve.is_active && !reserve.is_frozen && !reserve.is_paused;

        MarketParams {
            protocol: Protocol::Aave,
            market_id: Self::market_id(&reserve.pool, &reserve.asset.address),
            loan_token: None,
            collateral_token: None,
            liquidation_threshold,
            max_ltv: bps_to_fraction(reserve.ltv_bps),
            supply_apy: apr_to_apy(ray_to_fraction(reserve.liquidity_rate_ray)),
            borrow_apy: apr_to_apy(ray_to_fraction(reserve.variable_borrow_rate_ray)),
            // Reserve factor is already netted out of the liquidity rate
            fee_apy: 0.0,
            available_liquidity: reserve.available_liquidity,
            can_supply,
            can_borrow: can_supply && reserve.borrowing_enabled,
            margin_domain: format!("aave:{}", reserve.pool),
            asset: reserve.asset,
        }
    }
}

#[async_trait]
impl ProtocolAdapter for AaveV3Adapter {
    fn protocol(&self) -> Protocol {
        Protocol::Aave
    }

    #[instrument(skip(self))]
    async fn fetch_markets(&self) -> Result<FetchBatch<MarketParams>, SourceError> {
        let entries = self.source.fetch_markets(Protocol::Aave).await?;
        let batch = translate_markets(Protocol::Aave, entries, |raw| match raw {
            RawMarket::Aave(reserve) => Ok(vec![Self::translate(reserve)]),
            other => Err((
                other.protocol().to_string(),
                SourceError::Malformed("expected an aave reserve".into()),
            )),
        });

        debug!(
            markets = batch.items.len(),
            failures = batch.failures.len(),
            "Translated aave reserves"
        );
        Ok(batch)
    }

    #[instrument(skip(self), fields(owner = %owner))]
    async fn fetch_positions(&self, owner: Address) -> Result<FetchBatch<Position>, SourceError> {
        let (markets, account) = tokio::try_join!(
            self.fetch_markets(),
            self.source.fetch_account(Protocol::Aave, owner)
        )?;

        let reserves = match account {
            RawAccount::Aave { reserves } => reserves,
            other => {
                return Err(SourceError::Malformed(format!(
                    "expected aave account, got {}",
                    other.protocol()
                )))
            }
        };

        let index = index_markets(&markets.items);
        let mut batch = FetchBatch::new();

        for reserve in reserves {
            let borrow = reserve.variable_debt.saturating_add(reserve.stable_debt);
            if reserve.a_token_balance.is_zero() && borrow.is_zero() {
                continue;
            }

            let id = Self::market_id(&reserve.pool, &reserve.asset);
            let Some(market) = index.get(&id) else {
                batch.fail(Protocol::Aave, id.to_string(), unknown_market(&id));
                continue;
            };

            // A zero-LT reserve can never back debt, whatever the user flag says
            let collateral =
                reserve.usage_as_collateral_enabled && market.liquidation_threshold > 0.0;

            batch.items.push(Position::in_market(
                market,
                owner,
                reserve.a_token_balance,
                borrow,
                collateral,
            ));
        }

        debug!(positions = batch.items.len(), "Translated aave account");
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::fixtures::{owner, ray, usdc, weth, MemorySource};
    use crate::protocol::AaveUserReserve;
    use alloy::primitives::U256;
    use smallvec::smallvec;

    fn pool() -> Address {
        Address::repeat_byte(0x50)
    }

    fn reserve(asset: crate::protocol::Asset, lt_bps: u16) -> AaveReserve {
        AaveReserve {
            pool: pool(),
            asset,
            liquidation_threshold_bps: lt_bps,
            ltv_bps: lt_bps.saturating_sub(300),
            liquidity_rate_ray: ray(0.03),
            variable_borrow_rate_ray: ray(0.05),
            available_liquidity: U256::from(1_000_000u64),
            is_active: true,
            is_frozen: false,
            is_paused: false,
            borrowing_enabled: true,
        }
    }

    #[tokio::test]
    async fn test_translates_reserve_units() {
        let source = MemorySource::default().with_market(RawMarket::Aave(reserve(weth(), 8250)));
        let adapter = AaveV3Adapter::new(Arc::new(source));

        let batch = adapter.fetch_markets().await.unwrap();
        assert!(batch.is_complete());

        let market = &batch.items[0];
        assert!((market.liquidation_threshold - 0.825).abs() < 1e-12);
        assert!((market.max_ltv - 0.795).abs() < 1e-12);
        assert!(market.supply_apy > 0.03 && market.supply_apy < 0.031);
        assert!(market.borrow_apy > 0.05 && market.borrow_apy < 0.052);
        assert!(market.can_supply && market.can_borrow);
        assert!(market.margin_domain.starts_with("aave:"));
    }

    #[tokio::test]
    async fn test_frozen_reserve_flags() {
        let mut frozen = reserve(usdc(), 8000);
        frozen.is_frozen = true;
        let mut no_borrow = reserve(weth(), 8000);
        no_borrow.borrowing_enabled = false;

        let source = MemorySource::default()
            .with_market(RawMarket::Aave(frozen))
            .with_market(RawMarket::Aave(no_borrow));
        let batch = AaveV3Adapter::new(Arc::new(source))
            .fetch_markets()
            .await
            .unwrap();

        assert!(!batch.items[0].can_supply && !batch.items[0].can_borrow);
        assert!(batch.items[1].can_supply && !batch.items[1].can_borrow);
    }

    #[tokio::test]
    async fn test_invalid_threshold_is_reported_not_dropped() {
        let source = MemorySource::default()
            .with_market(RawMarket::Aave(reserve(usdc(), 8000)))
            .with_market(RawMarket::Aave(reserve(weth(), 12_000)))
            .with_broken_market(Protocol::Aave, SourceError::Malformed("bad abi".into()));

        let batch = AaveV3Adapter::new(Arc::new(source))
            .fetch_markets()
            .await
            .unwrap();

        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.failures.len(), 2);
        assert!(!batch.is_complete());
    }

    #[tokio::test]
    async fn test_positions_sum_debt_and_respect_zero_lt() {
        let source = MemorySource::default()
            .with_market(RawMarket::Aave(reserve(weth(), 8000)))
            .with_market(RawMarket::Aave(reserve(usdc(), 0)))
            .with_account(
                owner(),
                RawAccount::Aave {
                    reserves: smallvec![
                        AaveUserReserve {
                            pool: pool(),
                            asset: weth().address,
                            a_token_balance: U256::from(10u64),
                            variable_debt: U256::ZERO,
                            stable_debt: U256::ZERO,
                            usage_as_collateral_enabled: true,
                        },
                        AaveUserReserve {
                            pool: pool(),
                            asset: usdc().address,
                            a_token_balance: U256::from(7u64),
                            variable_debt: U256::from(3u64),
                            stable_debt: U256::from(2u64),
                            usage_as_collateral_enabled: true,
                        },
                    ],
                },
            );

        let batch = AaveV3Adapter::new(Arc::new(source))
            .fetch_positions(owner())
            .await
            .unwrap();

        assert!(batch.is_complete());
        assert_eq!(batch.items.len(), 2);
        assert!(batch.items[0].is_collateral_enabled);
        assert!(!batch.items[1].is_collateral_enabled);
        assert_eq!(batch.items[1].borrow_balance, U256::from(5u64));
        assert_eq!(batch.items[0].margin_domain, batch.items[1].margin_domain);
    }

    #[tokio::test]
    async fn test_same_asset_in_two_pools_stays_distinct() {
        let other_pool = Address::repeat_byte(0x51);
        let mut second = reserve(usdc(), 8000);
        second.pool = other_pool;

        let holding = |pool| AaveUserReserve {
            pool,
            asset: usdc().address,
            a_token_balance: U256::from(100u64),
            variable_debt: U256::from(10u64),
            stable_debt: U256::ZERO,
            usage_as_collateral_enabled: true,
        };
        let source = MemorySource::default()
            .with_market(RawMarket::Aave(reserve(usdc(), 8000)))
            .with_market(RawMarket::Aave(second))
            .with_account(
                owner(),
                RawAccount::Aave {
                    reserves: smallvec![holding(pool()), holding(other_pool)],
                },
            );

        let batch = AaveV3Adapter::new(Arc::new(source))
            .fetch_positions(owner())
            .await
            .unwrap();

        assert!(batch.is_complete());
        assert_eq!(batch.items.len(), 2);
        assert_ne!(batch.items[0].key(), batch.items[1].key());
        assert_ne!(batch.items[0].margin_domain, batch.items[1].margin_domain);
        assert_eq!(
            batch.items[1].market_id.to_string(),
            format!("{other_pool}/{}", usdc().address)
        );
    }

    #[tokio::test]
    async fn test_position_in_unknown_reserve_fails_entry() {
        let source = MemorySource::default().with_account(
            owner(),
            RawAccount::Aave {
                reserves: smallvec![AaveUserReserve {
                    pool: pool(),
                    asset: weth().address,
                    a_token_balance: U256::from(1u64),
                    variable_debt: U256::ZERO,
                    stable_debt: U256::ZERO,
                    usage_as_collateral_enabled: true,
                }],
            },
        );

        let batch = AaveV3Adapter::new(Arc::new(source))
            .fetch_positions(owner())
            .await
            .unwrap();

        assert!(batch.items.is_empty());
        assert_eq!(batch.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_source_fails_whole_call() {
        let source = MemorySource::default().unreachable(Protocol::Aave);
        let result = AaveV3Adapter::new(Arc::new(source))
            .fetch_positions(owner())
            .await;

        assert!(matches!(result, Err(SourceError::Connectivity(_))));
    }
}
