//! Routing recommender: best market to supply to or borrow from.

use alloy::primitives::{Address, U256};
use lendscope_chain::MarketParams;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::health::Action;

/// Routing tie-break tolerance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// APYs closer than this are considered equal (fraction, 0.0001 = 1 bp)
    #[serde(default = "default_apy_epsilon")]
    pub apy_epsilon: f64,
}

fn default_apy_epsilon() -> f64 {
    0.0001
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            apy_epsilon: default_apy_epsilon(),
        }
    }
}

/// A candidate market with the APY it was judged on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingOption {
    pub market: MarketParams,
    /// Net supply APY for supply, net borrow APY for borrow
    pub net_apy: f64,
}

impl RoutingOption {
    fn new(market: &MarketParams, action: Action) -> Self {
        let net_apy = match action {
            Action::Borrow => market.net_borrow_apy(),
            _ => market.net_supply_apy(),
        };
        Self {
            market: market.clone(),
            net_apy,
        }
    }
}

/// Whether `market` can absorb `desired_amount` of `asset` for `action`.
fn is_viable(market: &MarketParams, asset: Address, action: Action, desired_amount: U256) -> bool {
    let open = match action {
        Action::Supply => market.can_supply,
        Action::Borrow => market.can_borrow,
        Action::Withdraw | Action::Repay => false,
    };
    open && market.asset.address == asset && market.available_liquidity >= desired_amount
}

/// Index of the preferred option.
///
/// Options within `epsilon` of the best APY tie; among them the deepest
/// market wins, then the smaller protocol name, then the smaller market id.
fn select(options: &[RoutingOption], action: Action, epsilon: f64) -> Option<usize> {
    let best_apy = options.iter().map(|o| o.net_apy).reduce(|a, b| match action {
        Action::Borrow => a.min(b),
        _ => a.max(b),
    })?;

    options
        .iter()
        .enumerate()
        .filter(|(_, o)| (o.net_apy - best_apy).abs() <= epsilon)
        .min_by(|(_, a), (_, b)| tie_break(a, b))
        .map(|(index, _)| index)
}

fn tie_break(a: &RoutingOption, b: &RoutingOption) -> Ordering {
    b.market
        .available_liquidity
        .cmp(&a.market.available_liquidity)
        .then_with(|| a.market.protocol.as_str().cmp(b.market.protocol.as_str()))
        .then_with(|| a.market.market_id.cmp(&b.market.market_id))
}

/// Viable markets for `action`.
fn candidates(
    asset: Address,
    action: Action,
    desired_amount: U256,
    markets: &[MarketParams],
) -> Vec<RoutingOption> {
    markets
        .iter()
        .filter(|m| is_viable(m, asset, action, desired_amount))
        .map(|m| RoutingOption::new(m, action))
        .collect()
}

/// Best market for `action`, or `None` when no market is viable.
///
/// Markets without enough liquidity for `desired_amount` are excluded.
/// Withdraw and repay are never routable and yield `None`.
pub fn recommend(
    asset: Address,
    action: Action,
    desired_amount: U256,
    markets: &[MarketParams],
    config: &RoutingConfig,
) -> Option<RoutingOption> {
    let mut options = candidates(asset, action, desired_amount, markets);
    let best = select(&options, action, config.apy_epsilon)?;
    Some(options.swap_remove(best))
}

/// All viable markets, best first.
pub fn rank(
    asset: Address,
    action: Action,
    desired_amount: U256,
    markets: &[MarketParams],
    config: &RoutingConfig,
) -> Vec<RoutingOption> {
    let mut remaining = candidates(asset, action, desired_amount, markets);
    let mut ranked = Vec::with_capacity(remaining.len());

    while let Some(best) = select(&remaining, action, config.apy_epsilon) {
        ranked.push(remaining.remove(best));
    }
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{market, units, usdc, weth};
    use lendscope_chain::Protocol;

    fn config() -> RoutingConfig {
        RoutingConfig::default()
    }

    #[test]
    fn test_picks_highest_supply_apy() {
        let markets = vec![
            market(Protocol::Aave, "a", usdc(), 0.042, 0.06),
            market(Protocol::Morpho, "m", usdc(), 0.058, 0.07),
        ];

        let best = recommend(usdc().address, Action::Supply, units(&usdc(), 1_000), &markets, &config())
            .unwrap();
        assert_eq!(best.market.protocol, Protocol::Morpho);
        assert!((best.net_apy - 0.058).abs() < 1e-12);
    }

    #[test]
    fn test_insufficient_liquidity_excludes() {
        let mut shallow = market(Protocol::Morpho, "m", usdc(), 0.058, 0.07);
        shallow.available_liquidity = units(&usdc(), 500);
        let markets = vec![market(Protocol::Aave, "a", usdc(), 0.042, 0.06), shallow];

        let best = recommend(usdc().address, Action::Supply, units(&usdc(), 1_000), &markets, &config())
            .unwrap();
        assert_eq!(best.market.protocol, Protocol::Aave);
    }

    #[test]
    fn test_borrow_minimizes_net_apy() {
        let mut with_fee = market(Protocol::Compound, "c", usdc(), 0.03, 0.05);
        with_fee.fee_apy = 0.02;
        let markets = vec![with_fee, market(Protocol::Moonwell, "w", usdc(), 0.03, 0.06)];

        let best = recommend(usdc().address, Action::Borrow, U256::ZERO, &markets, &config()).unwrap();
        assert_eq!(best.market.protocol, Protocol::Moonwell);
    }

    #[test]
    fn test_epsilon_tie_prefers_liquidity_then_name() {
        let mut deep = market(Protocol::Moonwell, "w", usdc(), 0.05, 0.06);
        deep.available_liquidity = units(&usdc(), 5_000_000);
        let markets = vec![
            market(Protocol::Aave, "a", usdc(), 0.05005, 0.06),
            deep,
            market(Protocol::Compound, "c", usdc(), 0.05, 0.06),
        ];

        let ranked = rank(usdc().address, Action::Supply, U256::ZERO, &markets, &config());
        let order: Vec<_> = ranked.iter().map(|o| o.market.protocol).collect();
        assert_eq!(order, vec![Protocol::Moonwell, Protocol::Aave, Protocol::Compound]);
    }

    #[test]
    fn test_ties_are_measured_from_the_best() {
        let mut near = market(Protocol::Compound, "b", usdc(), 0.0500, 0.06);
        near.available_liquidity = units(&usdc(), 2_000_000);
        let mut far = market(Protocol::Morpho, "c", usdc(), 0.0499, 0.06);
        far.available_liquidity = units(&usdc(), 3_000_000);
        let markets = vec![market(Protocol::Aave, "a", usdc(), 0.0501, 0.06), near, far];

        let best = recommend(usdc().address, Action::Supply, U256::ZERO, &markets, &config()).unwrap();
        assert_eq!(best.market.protocol, Protocol::Compound);
    }

    #[test]
    fn test_respects_flags_and_asset() {
        let mut frozen = market(Protocol::Aave, "a", usdc(), 0.09, 0.01);
        frozen.can_supply = false;
        frozen.can_borrow = false;
        let markets = vec![frozen, market(Protocol::Morpho, "w", weth(), 0.2, 0.01)];

        assert!(recommend(usdc().address, Action::Supply, U256::ZERO, &markets, &config()).is_none());
        assert!(recommend(usdc().address, Action::Borrow, U256::ZERO, &markets, &config()).is_none());
    }

    #[test]
    fn test_withdraw_is_not_routable() {
        let markets = vec![market(Protocol::Aave, "a", usdc(), 0.04, 0.06)];
        assert!(recommend(usdc().address, Action::Withdraw, U256::ZERO, &markets, &config()).is_none());
        assert!(rank(usdc().address, Action::Repay, U256::ZERO, &markets, &config()).is_empty());
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let a = market(Protocol::Aave, "a", usdc(), 0.05, 0.06);
        let b = market(Protocol::Compound, "b", usdc(), 0.05004, 0.06);
        let c = market(Protocol::Morpho, "c", usdc(), 0.05008, 0.06);

        let forward = recommend(usdc().address, Action::Supply, U256::ZERO, &[a.clone(), b.clone(), c.clone()], &config());
        let backward = recommend(usdc().address, Action::Supply, U256::ZERO, &[c, b, a], &config());
        assert_eq!(forward, backward);
    }
}
