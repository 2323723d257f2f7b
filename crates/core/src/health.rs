//! Health factor calculation, simulation and risk tiers.
//!
//! The float functions are the reference formulas and assume validated
//! input: they assert on NaN, negative amounts and thresholds outside
//! [0, 1] instead of returning a plausible wrong number. [`MarginAccount`]
//! is the integer path used on live positions.

use alloy::primitives::U256;
use lendscope_chain::math::{fraction_to_wad, usd_wad, wad_div, wad_mul, wad_to_f64};
use lendscope_chain::{Position, PriceError, PriceLookup, PriceQuote};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User action that changes a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Supply,
    Withdraw,
    Borrow,
    Repay,
}

impl Action {
    /// Only supply and borrow venues can be recommended.
    pub fn is_routable(&self) -> bool {
        matches!(self, Self::Supply | Self::Borrow)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supply => "supply",
            Self::Withdraw => "withdraw",
            Self::Borrow => "borrow",
            Self::Repay => "repay",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "supply" | "deposit" => Ok(Self::Supply),
            "withdraw" => Ok(Self::Withdraw),
            "borrow" => Ok(Self::Borrow),
            "repay" => Ok(Self::Repay),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// Health factor: `(supply × lt) / borrow`, `+∞` without debt.
///
/// # Panics
///
/// On NaN or negative amounts, or `lt` outside [0, 1].
pub fn health_factor(supply_usd: f64, borrow_usd: f64, liquidation_threshold: f64) -> f64 {
    assert!(
        supply_usd.is_finite() && supply_usd >= 0.0,
        "supply_usd must be finite and non-negative, got {supply_usd}"
    );
    assert!(
        borrow_usd.is_finite() && borrow_usd >= 0.0,
        "borrow_usd must be finite and non-negative, got {borrow_usd}"
    );
    assert!(
        (0.0..=1.0).contains(&liquidation_threshold),
        "liquidation threshold must be in [0, 1], got {liquidation_threshold}"
    );

    if borrow_usd == 0.0 {
        return f64::INFINITY;
    }
    supply_usd * liquidation_threshold / borrow_usd
}

/// Projected health factor after applying `action` for `amount_usd`.
///
/// Balances are clamped at zero. No remaining debt gives `+∞`; no
/// remaining supply with debt gives `0`. Never negative.
///
/// # Panics
///
/// Under the same conditions as [`health_factor`], or on a NaN/negative amount.
pub fn simulate_health_factor(
    supply_usd: f64,
    borrow_usd: f64,
    liquidation_threshold: f64,
    action: Action,
    amount_usd: f64,
) -> f64 {
    assert!(
        amount_usd.is_finite() && amount_usd >= 0.0,
        "amount_usd must be finite and non-negative, got {amount_usd}"
    );

    let (supply, borrow) = match action {
        Action::Supply => (supply_usd + amount_usd, borrow_usd),
        Action::Withdraw => ((supply_usd - amount_usd).max(0.0), borrow_usd),
        Action::Borrow => (supply_usd, borrow_usd + amount_usd),
        Action::Repay => (supply_usd, (borrow_usd - amount_usd).max(0.0)),
    };

    if borrow <= 0.0 {
        return f64::INFINITY;
    }
    if supply <= 0.0 {
        return 0.0;
    }
    health_factor(supply, borrow, liquidation_threshold)
}

/// Discretized liquidation risk, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    /// No debt (HF = ∞)
    None,
    /// HF ≥ 2.0
    Safe,
    /// 1.5 ≤ HF < 2.0
    Healthy,
    /// 1.3 ≤ HF < 1.5
    Warning,
    /// 1.1 ≤ HF < 1.3
    Danger,
    /// 1.0 ≤ HF < 1.1
    Critical,
    /// HF < 1.0
    Liquidatable,
}

impl RiskTier {
    /// Classify a health factor. Lower edges are inclusive.
    pub fn from_health_factor(hf: f64) -> Self {
        if hf == f64::INFINITY {
            Self::None
        } else if hf >= 2.0 {
            Self::Safe
        } else if hf >= 1.5 {
            Self::Healthy
        } else if hf >= 1.3 {
            Self::Warning
        } else if hf >= 1.1 {
            Self::Danger
        } else if hf >= 1.0 {
            Self::Critical
        } else {
            Self::Liquidatable
        }
    }

    /// Smallest health factor inside this tier.
    pub fn lower_edge(&self) -> f64 {
        match self {
            Self::None => f64::INFINITY,
            Self::Safe => 2.0,
            Self::Healthy => 1.5,
            Self::Warning => 1.3,
            Self::Danger => 1.1,
            Self::Critical => 1.0,
            Self::Liquidatable => f64::NEG_INFINITY,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Safe => "safe",
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Danger => "danger",
            Self::Critical => "critical",
            Self::Liquidatable => "liquidatable",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Integer view of one owner's margin domain.
///
/// All USD figures are 18-decimal WAD values derived from integer balances
/// and live prices. Only collateral-enabled supply with a positive
/// threshold backs debt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarginAccount {
    /// Value of collateral-enabled supply
    collateral_wad: U256,
    /// Σ collateral value × liquidation threshold
    adjusted_collateral_wad: U256,
    /// Value of all debt
    debt_wad: U256,
}

impl MarginAccount {
    /// Evaluate the members of one margin domain against live prices.
    pub fn evaluate<'a>(
        positions: impl IntoIterator<Item = &'a Position>,
        prices: &dyn PriceLookup,
    ) -> Result<Self, PriceError> {
        let mut account = Self::default();

        for position in positions {
            let quote = prices.price(&position.asset.address)?;
            account.add(position, quote);
        }

        Ok(account)
    }

    fn add(&mut self, position: &Position, quote: PriceQuote) {
        let decimals = position.asset.decimals;

        if position.counts_as_collateral() {
            let value = usd_wad(position.supply_balance, quote.price, decimals);
            self.collateral_wad = self.collateral_wad.saturating_add(value);
            self.adjusted_collateral_wad = self
                .adjusted_collateral_wad
                .saturating_add(wad_mul(value, fraction_to_wad(position.liquidation_threshold)));
        }

        let debt = usd_wad(position.borrow_balance, quote.price, decimals);
        self.debt_wad = self.debt_wad.saturating_add(debt);
    }

    /// Collateral value in USD.
    pub fn supply_usd(&self) -> f64 {
        wad_to_f64(self.collateral_wad)
    }

    /// Debt value in USD.
    pub fn borrow_usd(&self) -> f64 {
        wad_to_f64(self.debt_wad)
    }

    /// Collateral-weighted liquidation threshold, 0 without collateral.
    pub fn effective_threshold(&self) -> f64 {
        if self.collateral_wad.is_zero() {
            return 0.0;
        }
        wad_to_f64(wad_div(self.adjusted_collateral_wad, self.collateral_wad))
    }

    pub fn has_debt(&self) -> bool {
        !self.debt_wad.is_zero()
    }

    /// Health factor of the domain, `+∞` without debt.
    pub fn health_factor(&self) -> f64 {
        if self.debt_wad.is_zero() {
            return f64::INFINITY;
        }
        wad_to_f64(wad_div(self.adjusted_collateral_wad, self.debt_wad))
    }

    /// The account after applying `action` with `amount` base units to `position`.
    ///
    /// Withdrawals and repayments are capped at the position's balance.
    /// Supplying an asset that does not count as collateral leaves the
    /// health factor unchanged.
    pub fn with_action(
        &self,
        position: &Position,
        quote: PriceQuote,
        action: Action,
        amount: U256,
    ) -> Self {
        let decimals = position.asset.decimals;
        let value = usd_wad(amount, quote.price, decimals);
        let lt = fraction_to_wad(position.liquidation_threshold);
        let collateral = position.is_collateral_enabled && position.liquidation_threshold > 0.0;
        let mut next = self.clone();

        match action {
            Action::Supply if collateral => {
                next.collateral_wad = next.collateral_wad.saturating_add(value);
                next.adjusted_collateral_wad =
                    next.adjusted_collateral_wad.saturating_add(wad_mul(value, lt));
            }
            Action::Supply => {}
            Action::Withdraw if collateral => {
                let held = usd_wad(position.supply_balance, quote.price, decimals);
                let removed = value.min(held);
                next.collateral_wad = next.collateral_wad.saturating_sub(removed);
                next.adjusted_collateral_wad =
                    next.adjusted_collateral_wad.saturating_sub(wad_mul(removed, lt));
            }
            Action::Withdraw => {}
            Action::Borrow => {
                next.debt_wad = next.debt_wad.saturating_add(value);
            }
            Action::Repay => {
                let owed = usd_wad(position.borrow_balance, quote.price, decimals);
                next.debt_wad = next.debt_wad.saturating_sub(value.min(owed));
            }
        }

        next
    }
}

/// Health factor of one position: `+∞` without debt, otherwise the health
/// factor of its margin domain.
pub fn position_health_factor<'a>(
    position: &Position,
    domain: impl IntoIterator<Item = &'a Position>,
    prices: &dyn PriceLookup,
) -> Result<f64, PriceError> {
    if !position.has_debt() {
        return Ok(f64::INFINITY);
    }
    Ok(MarginAccount::evaluate(domain, prices)?.health_factor())
}

/// Outcome of a hypothetical action on a live position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Simulation {
    pub action: Action,
    pub current_health_factor: f64,
    pub projected_health_factor: f64,
    pub projected_tier: RiskTier,
}

impl Simulation {
    /// Whether the action would leave the domain below 1.0.
    pub fn is_liquidatable(&self) -> bool {
        self.projected_tier == RiskTier::Liquidatable
    }
}

/// Simulate `action` with `amount` base units of `position`'s asset,
/// re-deriving its margin domain from integer balances and live prices.
pub fn simulate_position<'a>(
    position: &Position,
    domain: impl IntoIterator<Item = &'a Position>,
    prices: &dyn PriceLookup,
    action: Action,
    amount: U256,
) -> Result<Simulation, PriceError> {
    let account = MarginAccount::evaluate(domain, prices)?;
    let quote = prices.price(&position.asset.address)?;
    let projected = account.with_action(position, quote, action, amount);
    let projected_health_factor = projected.health_factor();

    Ok(Simulation {
        action,
        current_health_factor: account.health_factor(),
        projected_health_factor,
        projected_tier: RiskTier::from_health_factor(projected_health_factor),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{position, prices, usdc, weth};
    use lendscope_chain::Protocol;

    #[test]
    fn test_scenario_ten_k_supply() {
        let hf = health_factor(10_000.0, 4_000.0, 0.8);
        assert!((hf - 2.0).abs() < 1e-12);

        let projected = simulate_health_factor(10_000.0, 4_000.0, 0.8, Action::Borrow, 6_000.0);
        assert!((projected - 0.8).abs() < 1e-12);
        assert_eq!(RiskTier::from_health_factor(projected), RiskTier::Liquidatable);
    }

    #[test]
    fn test_no_debt_is_infinite() {
        assert_eq!(health_factor(123.0, 0.0, 0.5), f64::INFINITY);
        assert_eq!(health_factor(0.0, 0.0, 0.0), f64::INFINITY);
        assert_eq!(RiskTier::from_health_factor(f64::INFINITY), RiskTier::None);
    }

    #[test]
    fn test_simulation_clamps() {
        // Repaying more than owed leaves no debt
        assert_eq!(
            simulate_health_factor(100.0, 50.0, 0.8, Action::Repay, 80.0),
            f64::INFINITY
        );
        // Withdrawing everything with debt outstanding
        assert_eq!(
            simulate_health_factor(100.0, 50.0, 0.8, Action::Withdraw, 500.0),
            0.0
        );
        // Supplying improves
        assert!(simulate_health_factor(100.0, 50.0, 0.8, Action::Supply, 100.0) > 1.6);
    }

    #[test]
    #[should_panic(expected = "liquidation threshold")]
    fn test_rejects_threshold_above_one() {
        health_factor(100.0, 10.0, 1.2);
    }

    #[test]
    #[should_panic(expected = "supply_usd")]
    fn test_rejects_nan_supply() {
        health_factor(f64::NAN, 10.0, 0.8);
    }

    #[test]
    #[should_panic(expected = "amount_usd")]
    fn test_rejects_negative_amount() {
        simulate_health_factor(100.0, 10.0, 0.8, Action::Borrow, -1.0);
    }

    #[test]
    fn test_tier_edges_are_inclusive() {
        let cases = [
            (2.0, RiskTier::Safe),
            (1.9999, RiskTier::Healthy),
            (1.5, RiskTier::Healthy),
            (1.4999, RiskTier::Warning),
            (1.3, RiskTier::Warning),
            (1.1, RiskTier::Danger),
            (1.0999, RiskTier::Critical),
            (1.0, RiskTier::Critical),
            (0.9999, RiskTier::Liquidatable),
            (0.0, RiskTier::Liquidatable),
        ];
        for (hf, tier) in cases {
            assert_eq!(RiskTier::from_health_factor(hf), tier, "hf = {hf}");
        }
    }

    #[test]
    fn test_tier_severity_order() {
        assert!(RiskTier::None < RiskTier::Safe);
        assert!(RiskTier::Safe < RiskTier::Healthy);
        assert!(RiskTier::Critical < RiskTier::Liquidatable);
        for tier in [
            RiskTier::Safe,
            RiskTier::Healthy,
            RiskTier::Warning,
            RiskTier::Danger,
            RiskTier::Critical,
        ] {
            assert_eq!(RiskTier::from_health_factor(tier.lower_edge()), tier);
        }
    }

    #[test]
    fn test_margin_account_cross_collateral() {
        // 10k USDC collateral at LT 0.8, 1 WETH at $2000 with LT 0.85, 4k USDC debt
        let members = vec![
            position(Protocol::Aave, "usdc", usdc(), 10_000, 4_000, 0.8),
            position(Protocol::Aave, "weth", weth(), 1, 0, 0.85),
        ];
        let book = prices(&[(usdc(), 1.0), (weth(), 2_000.0)]);

        let account = MarginAccount::evaluate(&members, &book).unwrap();
        assert!((account.supply_usd() - 12_000.0).abs() < 1e-6);
        assert!((account.borrow_usd() - 4_000.0).abs() < 1e-6);

        let expected = (10_000.0 * 0.8 + 2_000.0 * 0.85) / 4_000.0;
        assert!((account.health_factor() - expected).abs() < 1e-9);
        assert!((account.effective_threshold() - 9_700.0 / 12_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_margin_account_missing_price() {
        let members = vec![position(Protocol::Aave, "weth", weth(), 1, 0, 0.85)];
        let book = prices(&[(usdc(), 1.0)]);
        assert!(matches!(
            MarginAccount::evaluate(&members, &book),
            Err(PriceError::Missing(_))
        ));
    }

    #[test]
    fn test_integer_simulation_matches_scenario() {
        let usdc_position = position(Protocol::Aave, "usdc", usdc(), 10_000, 4_000, 0.8);
        let book = prices(&[(usdc(), 1.0)]);
        let account = MarginAccount::evaluate([&usdc_position], &book).unwrap();
        assert!((account.health_factor() - 2.0).abs() < 1e-12);

        let quote = book[&usdc().address];
        let borrow_more = U256::from(6_000_000_000u64);
        let projected = account.with_action(&usdc_position, quote, Action::Borrow, borrow_more);
        assert!((projected.health_factor() - 0.8).abs() < 1e-12);

        // Repaying more than the position owes clears exactly its debt
        let repaid = account.with_action(&usdc_position, quote, Action::Repay, U256::from(9_000_000_000u64));
        assert_eq!(repaid.health_factor(), f64::INFINITY);
    }

    #[test]
    fn test_simulate_position_borrow_to_liquidation() {
        let usdc_position = position(Protocol::Compound, "comet", usdc(), 10_000, 4_000, 0.8);
        let book = prices(&[(usdc(), 1.0)]);

        let simulation = simulate_position(
            &usdc_position,
            [&usdc_position],
            &book,
            Action::Borrow,
            U256::from(6_000_000_000u64),
        )
        .unwrap();

        assert!((simulation.current_health_factor - 2.0).abs() < 1e-12);
        assert!((simulation.projected_health_factor - 0.8).abs() < 1e-12);
        assert!(simulation.is_liquidatable());
    }

    #[test]
    fn test_non_collateral_supply_does_not_help() {
        let mut loan_side = position(Protocol::Morpho, "0xabc", usdc(), 0, 1_000, 0.86);
        loan_side.is_collateral_enabled = false;
        let collateral = position(Protocol::Morpho, "0xabc/collateral", weth(), 1, 0, 0.86);
        let book = prices(&[(usdc(), 1.0), (weth(), 2_000.0)]);

        let account = MarginAccount::evaluate([&loan_side, &collateral], &book).unwrap();
        let before = account.health_factor();
        let after = account
            .with_action(&loan_side, book[&usdc().address], Action::Supply, U256::from(500_000_000u64))
            .health_factor();
        assert_eq!(before, after);
    }

    #[test]
    fn test_position_without_debt_is_infinite() {
        let supply_only = position(Protocol::Aave, "weth", weth(), 1, 0, 0.85);
        let borrower = position(Protocol::Aave, "usdc", usdc(), 0, 100, 0.8);
        let book = prices(&[(usdc(), 1.0), (weth(), 2_000.0)]);
        let domain = [&supply_only, &borrower];

        assert_eq!(
            position_health_factor(&supply_only, domain, &book).unwrap(),
            f64::INFINITY
        );
        let hf = position_health_factor(&borrower, domain, &book).unwrap();
        assert!((hf - 17.0).abs() < 1e-9);
    }
}
