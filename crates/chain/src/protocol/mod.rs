//! Protocol abstraction layer for multi-protocol support.
//!
//! Every lending protocol encodes collateral risk differently. The adapters
//! in this module translate the protocol-native records delivered by a
//! [`ChainDataSource`] into one common schema ([`MarketParams`] and
//! [`Position`]) so downstream logic never branches on the protocol.
//!
//! # Architecture
//!
//! - [`Protocol`]: closed set of supported protocols
//! - [`ProtocolAdapter`]: per-protocol translation into the common schema
//! - [`AdapterSet`]: bounded, cancellable fan-out across all adapters
//!
//! # Example
//!
//! ```rust,ignore
//! use lendscope_chain::protocol::{AdapterSet, Protocol};
//!
//! let adapters = AdapterSet::with_default_adapters(source, fetch_config);
//! let sweep = adapters.refresh_positions(owner, &cancel).await?;
//!
//! for (protocol, outcome) in sweep.outcomes() {
//!     // Degraded outcomes are "unknown", never "zero"
//! }
//! ```

mod aave_v3;
mod compound_v3;
mod fanout;
mod moonwell;
mod morpho_blue;
mod raw;

#[cfg(test)]
pub(crate) mod fixtures;

pub use aave_v3::AaveV3Adapter;
pub use compound_v3::CompoundV3Adapter;
pub use fanout::{AdapterSet, FetchConfig, ProtocolSweep};
pub use moonwell::MoonwellAdapter;
pub use morpho_blue::MorphoBlueAdapter;
pub use raw::{
    AaveReserve, AaveUserReserve, ChainDataSource, CometCollateral, CometMarket,
    CometUserCollateral, CometUserPosition, MoonwellMarket, MoonwellUserMarket, MorphoMarket,
    MorphoUserPosition, RawAccount, RawMarket, SourceError,
};

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::str::FromStr;

/// Supported lending protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Aave V3: unified cross-margin account, per-reserve liquidation threshold
    Aave,
    /// Morpho Blue: isolated markets with a per-market LLTV
    Morpho,
    /// Compound III (Comet): one base asset per market, collateral factors
    Compound,
    /// Moonwell: Compound-V2 style cross-margin with a single collateral factor
    Moonwell,
}

impl Protocol {
    /// All protocols in canonical order.
    pub const ALL: [Protocol; 4] = [
        Protocol::Aave,
        Protocol::Morpho,
        Protocol::Compound,
        Protocol::Moonwell,
    ];

    /// Stable lowercase name, also used for deterministic tie-breaks.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aave => "aave",
            Self::Morpho => "morpho",
            Self::Compound => "compound",
            Self::Moonwell => "moonwell",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aave" | "aave-v3" | "aavev3" | "aave_v3" => Ok(Self::Aave),
            "morpho" | "morpho-blue" | "morphoblue" | "morpho_blue" => Ok(Self::Morpho),
            "compound" | "compound-v3" | "compoundv3" | "compound_v3" | "comet" => {
                Ok(Self::Compound)
            }
            "moonwell" => Ok(Self::Moonwell),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// Fungible token reference data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    /// Token symbol (e.g., "USDC")
    pub symbol: String,
    /// Token decimals
    pub decimals: u8,
    /// Token contract address
    pub address: Address,
}

impl Asset {
    /// Create a new asset.
    pub fn new(symbol: impl Into<String>, decimals: u8, address: Address) -> Self {
        Self {
            symbol: symbol.into(),
            decimals,
            address,
        }
    }
}

/// Market identifier, unique within a protocol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MarketId(pub String);

impl MarketId {
    /// Create a market id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Protocol-agnostic lending market descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketParams {
    pub protocol: Protocol,
    pub market_id: MarketId,
    /// Asset supplied to / borrowed from this market
    pub asset: Asset,
    /// Loan token (isolated markets only)
    pub loan_token: Option<Asset>,
    /// Collateral token (isolated markets only)
    pub collateral_token: Option<Asset>,
    /// Fraction of collateral value counted toward the health factor, [0, 1]
    pub liquidation_threshold: f64,
    /// Maximum loan-to-value at origination, [0, 1]
    pub max_ltv: f64,
    pub supply_apy: f64,
    pub borrow_apy: f64,
    /// Protocol or platform fee expressed in APY points
    pub fee_apy: f64,
    /// Liquidity available to withdraw or borrow (asset base units)
    pub available_liquidity: U256,
    pub can_supply: bool,
    pub can_borrow: bool,
    /// Positions sharing a margin domain are liquidated together
    pub margin_domain: String,
}

impl MarketParams {
    /// Supply APY net of protocol fees.
    pub fn net_supply_apy(&self) -> f64 {
        self.supply_apy - self.fee_apy
    }

    /// Borrow APY including protocol fees.
    pub fn net_borrow_apy(&self) -> f64 {
        self.borrow_apy + self.fee_apy
    }

    /// Check the translated risk fields are usable.
    pub fn validate(&self) -> Result<(), String> {
        check_fraction("liquidation_threshold", self.liquidation_threshold)?;
        check_fraction("max_ltv", self.max_ltv)?;
        for (name, value) in [
            ("supply_apy", self.supply_apy),
            ("borrow_apy", self.borrow_apy),
            ("fee_apy", self.fee_apy),
        ] {
            if !value.is_finite() {
                return Err(format!("{name} is not finite: {value}"));
            }
        }
        Ok(())
    }
}

/// Unique key of a position within a poll.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub owner: Address,
    pub protocol: Protocol,
    pub market_id: MarketId,
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.protocol, self.market_id)
    }
}

/// A user's stake in one market.
///
/// Balances are unsigned integers in the asset's base units. The health
/// factor is derived on demand and never stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub owner: Address,
    pub protocol: Protocol,
    pub market_id: MarketId,
    pub asset: Asset,
    pub supply_balance: U256,
    pub borrow_balance: U256,
    pub is_collateral_enabled: bool,
    pub current_supply_apy: f64,
    pub current_borrow_apy: f64,
    /// Liquidation threshold of the market at poll time
    pub liquidation_threshold: f64,
    /// Margin domain shared with the other positions it is netted against
    pub margin_domain: String,
}

impl Position {
    /// Key identifying this position.
    pub fn key(&self) -> PositionKey {
        PositionKey {
            owner: self.owner,
            protocol: self.protocol,
            market_id: self.market_id.clone(),
        }
    }

    /// A position with no balances is logically absent.
    pub fn is_empty(&self) -> bool {
        self.supply_balance.is_zero() && self.borrow_balance.is_zero()
    }

    /// Whether this position carries debt.
    pub fn has_debt(&self) -> bool {
        !self.borrow_balance.is_zero()
    }

    /// Whether the supplied balance secures debt in its margin domain.
    pub fn counts_as_collateral(&self) -> bool {
        self.is_collateral_enabled && !self.supply_balance.is_zero() && self.liquidation_threshold > 0.0
    }

    /// Build a position from the market it belongs to.
    pub fn in_market(
        market: &MarketParams,
        owner: Address,
        supply_balance: U256,
        borrow_balance: U256,
        is_collateral_enabled: bool,
    ) -> Self {
        Self {
            owner,
            protocol: market.protocol,
            market_id: market.market_id.clone(),
            asset: market.asset.clone(),
            supply_balance,
            borrow_balance,
            is_collateral_enabled,
            current_supply_apy: market.supply_apy,
            current_borrow_apy: market.borrow_apy,
            liquidation_threshold: market.liquidation_threshold,
            margin_domain: market.margin_domain.clone(),
        }
    }
}

/// A single entry (market or position) that could not be translated.
#[derive(Debug, Clone)]
pub struct EntryFailure {
    pub protocol: Protocol,
    /// Identifier of the failing entry, as reported by the source
    pub entry: String,
    pub error: SourceError,
}

impl fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} entry {}: {}", self.protocol, self.entry, self.error)
    }
}

/// Partial result of a fetch: successfully translated items plus the
/// entries that failed. A batch with failures is degraded, not empty.
#[derive(Debug, Clone)]
pub struct FetchBatch<T> {
    pub items: Vec<T>,
    pub failures: Vec<EntryFailure>,
}

impl<T> FetchBatch<T> {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Whether every entry translated.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Record a failing entry.
    pub fn fail(&mut self, protocol: Protocol, entry: impl Into<String>, error: SourceError) {
        self.failures.push(EntryFailure {
            protocol,
            entry: entry.into(),
            error,
        });
    }
}

impl<T> Default for FetchBatch<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Core trait for per-protocol data translation.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync + Debug {
    /// Protocol handled by this adapter.
    fn protocol(&self) -> Protocol;

    /// Fetch all markets of the protocol in the common schema.
    ///
    /// Returns `Err` only when the whole call failed; individual bad
    /// markets are reported in [`FetchBatch::failures`].
    async fn fetch_markets(&self) -> Result<FetchBatch<MarketParams>, SourceError>;

    /// Fetch an owner's positions in the common schema.
    async fn fetch_positions(&self, owner: Address) -> Result<FetchBatch<Position>, SourceError>;
}

/// Translate raw market entries, keeping valid markets and recording the rest.
///
/// `translate` returns the markets derived from one raw record, or the
/// identifier of the record together with the reason it was rejected.
pub(crate) fn translate_markets<F>(
    protocol: Protocol,
    entries: Vec<Result<RawMarket, SourceError>>,
    mut translate: F,
) -> FetchBatch<MarketParams>
where
    F: FnMut(RawMarket) -> Result<Vec<MarketParams>, (String, SourceError)>,
{
    let mut batch = FetchBatch::new();

    for (index, entry) in entries.into_iter().enumerate() {
        let raw = match entry {
            Ok(raw) if raw.protocol() == protocol => raw,
            Ok(raw) => {
                batch.fail(
                    protocol,
                    format!("#{index}"),
                    SourceError::Malformed(format!("{} record in {protocol} feed", raw.protocol())),
                );
                continue;
            }
            Err(e) => {
                batch.fail(protocol, format!("#{index}"), e);
                continue;
            }
        };

        match translate(raw) {
            Ok(markets) => {
                for market in markets {
                    match market.validate() {
                        Ok(()) => batch.items.push(market),
                        Err(reason) => batch.fail(
                            protocol,
                            market.market_id.to_string(),
                            SourceError::Malformed(reason),
                        ),
                    }
                }
            }
            Err((entry, error)) => batch.fail(protocol, entry, error),
        }
    }

    batch
}

/// Index translated markets by id for position lookups.
pub(crate) fn index_markets(markets: &[MarketParams]) -> HashMap<&MarketId, &MarketParams> {
    markets.iter().map(|m| (&m.market_id, m)).collect()
}

/// Error for an account entry that points at a market we could not translate.
pub(crate) fn unknown_market(id: &MarketId) -> SourceError {
    SourceError::Malformed(format!("position references unknown market {id}"))
}

fn check_fraction(name: &str, value: f64) -> Result<(), String> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(format!("{name} outside [0, 1]: {value}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(lt: f64, ltv: f64) -> MarketParams {
        MarketParams {
            protocol: Protocol::Aave,
            market_id: MarketId::new("usdc"),
            asset: Asset::new("USDC", 6, Address::repeat_byte(1)),
            loan_token: None,
            collateral_token: None,
            liquidation_threshold: lt,
            max_ltv: ltv,
            supply_apy: 0.04,
            borrow_apy: 0.06,
            fee_apy: 0.005,
            available_liquidity: U256::from(1_000u64),
            can_supply: true,
            can_borrow: true,
            margin_domain: "aave:pool".into(),
        }
    }

    #[test]
    fn test_market_validation() {
        assert!(market(0.8, 0.75).validate().is_ok());
        assert!(market(1.2, 0.75).validate().is_err());
        assert!(market(0.8, -0.1).validate().is_err());
        assert!(market(f64::NAN, 0.5).validate().is_err());
    }

    #[test]
    fn test_net_apys_apply_fees() {
        let m = market(0.8, 0.75);
        assert!((m.net_supply_apy() - 0.035).abs() < 1e-12);
        assert!((m.net_borrow_apy() - 0.065).abs() < 1e-12);
    }

    #[test]
    fn test_position_from_market() {
        let m = market(0.8, 0.75);
        let owner = Address::repeat_byte(9);
        let position = Position::in_market(&m, owner, U256::from(5u64), U256::ZERO, true);

        assert_eq!(position.margin_domain, "aave:pool");
        assert!(position.counts_as_collateral());
        assert!(!position.has_debt());
        assert_eq!(position.key().owner, owner);

        let empty = Position::in_market(&m, owner, U256::ZERO, U256::ZERO, true);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("aave-v3".parse::<Protocol>(), Ok(Protocol::Aave));
        assert_eq!("Morpho-Blue".parse::<Protocol>(), Ok(Protocol::Morpho));
        assert_eq!("comet".parse::<Protocol>(), Ok(Protocol::Compound));
        assert_eq!("moonwell".parse::<Protocol>(), Ok(Protocol::Moonwell));
        assert!("euler".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_protocol_names_are_ordered_for_tie_breaks() {
        let mut names: Vec<_> = Protocol::ALL.iter().map(|p| p.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["aave", "compound", "moonwell", "morpho"]);
    }
}
