//! Portfolio aggregator.

use alloy::primitives::{Address, U256};
use lendscope_chain::math::{usd_wad, wad_to_f64};
use lendscope_chain::{PositionKey, PriceError, PriceLookup, PriceQuote, Protocol};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::health::MarginAccount;
use crate::normalizer::PositionSet;

/// Portfolio totals for one position set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioStats {
    pub total_supply_usd: f64,
    pub total_borrow_usd: f64,
    pub net_worth_usd: f64,
    /// Supply APY weighted by supplied USD, 0 with nothing supplied
    pub weighted_avg_supply_apy: f64,
    /// Borrow APY weighted by borrowed USD, 0 with nothing borrowed
    pub weighted_avg_borrow_apy: f64,
    /// Minimum health factor over positions with debt, `+∞` if none
    pub lowest_health_factor: f64,
    /// Positions left out of the totals for lack of a usable price
    pub unpriced: Vec<PositionKey>,
}

impl PortfolioStats {
    /// Whether every position was priced.
    pub fn is_complete(&self) -> bool {
        self.unpriced.is_empty()
    }
}

/// Stats for the whole set plus one entry per protocol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioReport {
    pub stats: PortfolioStats,
    pub by_protocol: BTreeMap<Protocol, PortfolioStats>,
}

/// One lookup per asset, so a poll sees a single consistent price.
fn snapshot(
    positions: &PositionSet,
    prices: &dyn PriceLookup,
) -> (HashMap<Address, PriceQuote>, HashMap<Address, PriceError>) {
    let mut priced = HashMap::new();
    let mut failed = HashMap::new();

    for position in positions {
        let asset = position.asset.address;
        if priced.contains_key(&asset) || failed.contains_key(&asset) {
            continue;
        }
        match prices.price(&asset) {
            Ok(quote) => {
                priced.insert(asset, quote);
            }
            Err(e) => {
                failed.insert(asset, e);
            }
        }
    }

    (priced, failed)
}

/// Aggregate a position set against live prices.
///
/// Positions whose asset cannot be priced are excluded from the totals and
/// listed in `unpriced`; a margin domain containing one is left out of
/// `lowest_health_factor` because its health is unknown.
pub fn aggregate(positions: &PositionSet, prices: &dyn PriceLookup) -> PortfolioStats {
    let (priced, failed) = snapshot(positions, prices);

    let mut total_supply = U256::ZERO;
    let mut total_borrow = U256::ZERO;
    let mut supply_apy_weight = 0.0;
    let mut borrow_apy_weight = 0.0;
    let mut unpriced = Vec::new();

    for position in positions {
        let Some(quote) = priced.get(&position.asset.address) else {
            if let Some(e) = failed.get(&position.asset.address) {
                warn!(position = %position.key(), error = %e, "Position left out of portfolio totals");
            }
            unpriced.push(position.key());
            continue;
        };

        let decimals = position.asset.decimals;
        let supply = usd_wad(position.supply_balance, quote.price, decimals);
        let borrow = usd_wad(position.borrow_balance, quote.price, decimals);

        total_supply = total_supply.saturating_add(supply);
        total_borrow = total_borrow.saturating_add(borrow);
        supply_apy_weight += wad_to_f64(supply) * position.current_supply_apy;
        borrow_apy_weight += wad_to_f64(borrow) * position.current_borrow_apy;
    }

    let mut lowest_health_factor = f64::INFINITY;
    for (domain, members) in positions.domains() {
        if !members.iter().any(|p| p.has_debt()) {
            continue;
        }
        if members.iter().any(|p| !priced.contains_key(&p.asset.address)) {
            debug!(owner = %domain.owner, domain = %domain.domain, "Skipping domain with unpriced members");
            continue;
        }
        // Every member is in the snapshot, so evaluation cannot miss a price.
        if let Ok(account) = MarginAccount::evaluate(members.iter().copied(), &priced) {
            lowest_health_factor = lowest_health_factor.min(account.health_factor());
        }
    }

    let total_supply_usd = wad_to_f64(total_supply);
    let total_borrow_usd = wad_to_f64(total_borrow);

    PortfolioStats {
        total_supply_usd,
        total_borrow_usd,
        net_worth_usd: total_supply_usd - total_borrow_usd,
        weighted_avg_supply_apy: weighted(supply_apy_weight, total_supply_usd),
        weighted_avg_borrow_apy: weighted(borrow_apy_weight, total_borrow_usd),
        lowest_health_factor,
        unpriced,
    }
}

fn weighted(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// Aggregate the whole set and each protocol separately.
pub fn aggregate_report(positions: &PositionSet, prices: &dyn PriceLookup) -> PortfolioReport {
    let by_protocol = positions
        .protocols()
        .into_iter()
        .map(|protocol| (protocol, aggregate(&positions.only_protocol(protocol), prices)))
        .collect();

    PortfolioReport {
        stats: aggregate(positions, prices),
        by_protocol,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::normalize;
    use crate::testing::{position, prices, usdc, weth};

    #[test]
    fn test_empty_set() {
        let stats = aggregate(&PositionSet::empty(), &prices(&[]));
        assert_eq!(stats.total_supply_usd, 0.0);
        assert_eq!(stats.weighted_avg_supply_apy, 0.0);
        assert_eq!(stats.lowest_health_factor, f64::INFINITY);
        assert!(stats.is_complete());
    }

    #[test]
    fn test_totals_and_weighted_apy() {
        let mut eth = position(Protocol::Aave, "weth", weth(), 1, 0, 0.85);
        eth.current_supply_apy = 0.02;
        let mut cash = position(Protocol::Compound, "usdc", usdc(), 2_000, 1_000, 0.8);
        cash.current_supply_apy = 0.05;
        cash.current_borrow_apy = 0.07;

        let set = normalize(vec![eth, cash]).unwrap();
        let stats = aggregate(&set, &prices(&[(usdc(), 1.0), (weth(), 2_000.0)]));

        assert!((stats.total_supply_usd - 4_000.0).abs() < 1e-9);
        assert!((stats.total_borrow_usd - 1_000.0).abs() < 1e-9);
        assert!((stats.net_worth_usd - 3_000.0).abs() < 1e-9);
        assert!((stats.weighted_avg_supply_apy - 0.035).abs() < 1e-12);
        assert!((stats.weighted_avg_borrow_apy - 0.07).abs() < 1e-12);
        // Compound domain: 2000 × 0.8 / 1000
        assert!((stats.lowest_health_factor - 1.6).abs() < 1e-9);
    }

    #[test]
    fn test_unpriced_positions_are_reported() {
        let set = normalize(vec![
            position(Protocol::Aave, "weth", weth(), 1, 0, 0.85),
            position(Protocol::Aave, "usdc", usdc(), 0, 500, 0.8),
            position(Protocol::Moonwell, "usdc", usdc(), 1_000, 100, 0.8),
        ])
        .unwrap();

        let stats = aggregate(&set, &prices(&[(usdc(), 1.0)]));

        assert_eq!(stats.unpriced.len(), 1);
        assert_eq!(stats.unpriced[0].protocol, Protocol::Aave);
        assert!((stats.total_supply_usd - 1_000.0).abs() < 1e-9);
        // The Aave domain cannot be judged, only Moonwell counts
        assert!((stats.lowest_health_factor - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_idempotent() {
        let set = normalize(vec![
            position(Protocol::Aave, "weth", weth(), 3, 0, 0.85),
            position(Protocol::Aave, "usdc", usdc(), 1_234, 777, 0.8),
            position(Protocol::Morpho, "m", usdc(), 99, 12, 0.9),
        ])
        .unwrap();
        let book = prices(&[(usdc(), 0.9997), (weth(), 1_987.31)]);

        let first = aggregate(&set, &book);
        let second = aggregate(&set, &book);
        assert_eq!(first, second);
        assert_eq!(first.lowest_health_factor.to_bits(), second.lowest_health_factor.to_bits());
    }

    #[test]
    fn test_report_splits_protocols() {
        let set = normalize(vec![
            position(Protocol::Aave, "usdc", usdc(), 1_000, 0, 0.8),
            position(Protocol::Moonwell, "usdc", usdc(), 500, 400, 0.8),
        ])
        .unwrap();

        let report = aggregate_report(&set, &prices(&[(usdc(), 1.0)]));
        assert_eq!(report.by_protocol.len(), 2);
        assert!((report.by_protocol[&Protocol::Aave].total_supply_usd - 1_000.0).abs() < 1e-9);
        assert_eq!(report.by_protocol[&Protocol::Aave].lowest_health_factor, f64::INFINITY);
        assert!((report.stats.lowest_health_factor - 1.0).abs() < 1e-9);
    }
}
