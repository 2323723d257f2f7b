//! Query facade over adapters, prices and the pure calculators.

use alloy::primitives::{Address, U256};
use lendscope_chain::{
    AdapterSet, CancelSignal, MarketParams, PositionKey, PriceLookup, ProtocolSweep,
};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::aggregator::{aggregate, aggregate_report, PortfolioReport, PortfolioStats};
use crate::error::{EngineError, EngineResult};
use crate::health::{simulate_position, Action, Simulation};
use crate::normalizer::{normalize, PositionSet};
use crate::routing::{rank, recommend, RoutingConfig, RoutingOption};

/// Read-only lending engine.
///
/// Every call fetches fresh data; nothing is cached between calls.
#[derive(Clone)]
pub struct LendingEngine {
    adapters: AdapterSet,
    prices: Arc<dyn PriceLookup>,
    routing: RoutingConfig,
}

impl LendingEngine {
    pub fn new(adapters: AdapterSet, prices: Arc<dyn PriceLookup>, routing: RoutingConfig) -> Self {
        Self {
            adapters,
            prices,
            routing,
        }
    }

    /// An owner's normalized positions across every protocol.
    ///
    /// Any adapter or entry failure makes the set unusable: a missing
    /// position would understate risk.
    #[instrument(skip(self, cancel), fields(owner = %owner))]
    pub async fn positions(&self, owner: Address, cancel: &CancelSignal) -> EngineResult<PositionSet> {
        let sweep = self.adapters.refresh_positions(owner, cancel).await?;
        if !sweep.is_complete() {
            return Err(EngineError::DataUnavailable(sweep.problems().join("; ")));
        }
        normalize(sweep.into_items())
    }

    /// Portfolio totals for an owner.
    pub async fn portfolio_stats(
        &self,
        owner: Address,
        cancel: &CancelSignal,
    ) -> EngineResult<PortfolioStats> {
        let positions = self.positions(owner, cancel).await?;
        Ok(aggregate(&positions, self.prices.as_ref()))
    }

    /// Portfolio totals with a per-protocol breakdown.
    pub async fn portfolio_report(
        &self,
        owner: Address,
        cancel: &CancelSignal,
    ) -> EngineResult<PortfolioReport> {
        let positions = self.positions(owner, cancel).await?;
        Ok(aggregate_report(&positions, self.prices.as_ref()))
    }

    /// Best market for supplying or borrowing `desired_amount` of `asset`.
    ///
    /// `Ok(None)` means no market can take the amount.
    #[instrument(skip(self, cancel), fields(asset = %asset, action = %action))]
    pub async fn recommendation(
        &self,
        asset: Address,
        action: Action,
        desired_amount: U256,
        cancel: &CancelSignal,
    ) -> EngineResult<Option<RoutingOption>> {
        let markets = self.routable_markets(action, cancel).await?;
        let best = recommend(asset, action, desired_amount, &markets, &self.routing);
        debug!(
            candidates = markets.len(),
            found = best.is_some(),
            "Routing recommendation computed"
        );
        Ok(best)
    }

    /// Every viable market for the request, best first.
    pub async fn ranked_markets(
        &self,
        asset: Address,
        action: Action,
        desired_amount: U256,
        cancel: &CancelSignal,
    ) -> EngineResult<Vec<RoutingOption>> {
        let markets = self.routable_markets(action, cancel).await?;
        Ok(rank(asset, action, desired_amount, &markets, &self.routing))
    }

    async fn routable_markets(
        &self,
        action: Action,
        cancel: &CancelSignal,
    ) -> EngineResult<Vec<MarketParams>> {
        if !action.is_routable() {
            return Err(EngineError::InvalidInput(format!(
                "{action} has no venue to recommend"
            )));
        }

        let sweep = self.adapters.refresh_markets(cancel).await?;
        usable_markets(sweep)
    }

    /// Project the health factor of `key`'s margin domain after `action`
    /// with `amount` base units of the position's asset.
    #[instrument(skip(self, cancel), fields(owner = %owner, position = %key, action = %action))]
    pub async fn simulate(
        &self,
        owner: Address,
        key: &PositionKey,
        action: Action,
        amount: U256,
        cancel: &CancelSignal,
    ) -> EngineResult<Simulation> {
        if key.owner != owner {
            return Err(EngineError::InvalidInput(format!(
                "position {key} does not belong to {owner}"
            )));
        }

        let positions = self.positions(owner, cancel).await?;
        let position = positions
            .get(key)
            .ok_or_else(|| EngineError::InvalidInput(format!("no position {key}")))?;

        let simulation = simulate_position(
            position,
            positions.domain_of(position),
            self.prices.as_ref(),
            action,
            amount,
        )?;

        debug!(
            current = simulation.current_health_factor,
            projected = simulation.projected_health_factor,
            tier = %simulation.projected_tier,
            "Simulated action"
        );
        Ok(simulation)
    }
}

/// Markets from every adapter that answered. A protocol that failed as a
/// whole makes the comparison meaningless; single bad entries do not.
fn usable_markets(sweep: ProtocolSweep<MarketParams>) -> EngineResult<Vec<MarketParams>> {
    let failed: Vec<String> = sweep
        .outcomes()
        .iter()
        .filter_map(|(protocol, outcome)| outcome.as_ref().err().map(|e| format!("{protocol}: {e}")))
        .collect();
    if !failed.is_empty() {
        return Err(EngineError::DataUnavailable(failed.join("; ")));
    }

    if !sweep.is_complete() {
        warn!(problems = ?sweep.problems(), "Routing without some markets");
    }
    Ok(sweep.into_items())
}
