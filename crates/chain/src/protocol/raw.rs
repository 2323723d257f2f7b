//! Protocol-native records delivered by a chain data source.
//!
//! These mirror what each protocol exposes on-chain (or via its indexer),
//! in the protocol's own units: basis points, ray and WAD mantissas,
//! per-second rates. Translation into the common schema happens in the
//! adapters, never here.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::Debug;
use thiserror::Error;

use super::{Asset, Protocol};

/// Failure reported by a chain data source.
///
/// Every variant means "unknown", never "zero".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("stale block: source at {source_block}, required {required_block}")]
    StaleBlock { source_block: u64, required_block: u64 },

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,
}

impl SourceError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Malformed(_))
    }
}

/// Read-only access to protocol state.
#[async_trait]
pub trait ChainDataSource: Send + Sync + Debug {
    /// Fetch every market of a protocol.
    ///
    /// The outer `Err` means the whole call failed; inner errors identify
    /// individual entries the source could not decode.
    async fn fetch_markets(
        &self,
        protocol: Protocol,
    ) -> Result<Vec<Result<RawMarket, SourceError>>, SourceError>;

    /// Fetch one account's raw state in a protocol.
    async fn fetch_account(
        &self,
        protocol: Protocol,
        owner: Address,
    ) -> Result<RawAccount, SourceError>;
}

/// Raw market record of any protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum RawMarket {
    Aave(AaveReserve),
    Morpho(MorphoMarket),
    Compound(CometMarket),
    Moonwell(MoonwellMarket),
}

impl RawMarket {
    /// Protocol this record belongs to.
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Aave(_) => Protocol::Aave,
            Self::Morpho(_) => Protocol::Morpho,
            Self::Compound(_) => Protocol::Compound,
            Self::Moonwell(_) => Protocol::Moonwell,
        }
    }
}

/// Raw account record of any protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum RawAccount {
    Aave {
        reserves: SmallVec<[AaveUserReserve; 4]>,
    },
    Morpho {
        positions: SmallVec<[MorphoUserPosition; 4]>,
    },
    Compound {
        positions: SmallVec<[CometUserPosition; 2]>,
    },
    Moonwell {
        markets: SmallVec<[MoonwellUserMarket; 4]>,
    },
}

impl RawAccount {
    /// Protocol this record belongs to.
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Aave { .. } => Protocol::Aave,
            Self::Morpho { .. } => Protocol::Morpho,
            Self::Compound { .. } => Protocol::Compound,
            Self::Moonwell { .. } => Protocol::Moonwell,
        }
    }

    /// Account with no entries for a protocol.
    pub fn empty(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Aave => Self::Aave {
                reserves: SmallVec::new(),
            },
            Protocol::Morpho => Self::Morpho {
                positions: SmallVec::new(),
            },
            Protocol::Compound => Self::Compound {
                positions: SmallVec::new(),
            },
            Protocol::Moonwell => Self::Moonwell {
                markets: SmallVec::new(),
            },
        }
    }
}

// ============================================================================
// Aave V3
// ============================================================================

/// Aave V3 reserve configuration and state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AaveReserve {
    pub pool: Address,
    pub asset: Asset,
    /// Liquidation threshold in basis points
    pub liquidation_threshold_bps: u16,
    /// Max LTV in basis points
    pub ltv_bps: u16,
    /// Current liquidity rate (APR, ray)
    pub liquidity_rate_ray: U256,
    /// Current variable borrow rate (APR, ray)
    pub variable_borrow_rate_ray: U256,
    /// Underlying held by the aToken, available to withdraw or borrow
    pub available_liquidity: U256,
    pub is_active: bool,
    pub is_frozen: bool,
    pub is_paused: bool,
    pub borrowing_enabled: bool,
}

/// A user's balances in one Aave reserve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AaveUserReserve {
    pub pool: Address,
    pub asset: Address,
    pub a_token_balance: U256,
    pub variable_debt: U256,
    pub stable_debt: U256,
    pub usage_as_collateral_enabled: bool,
}

// ============================================================================
// Morpho Blue
// ============================================================================

/// Morpho Blue isolated market state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MorphoMarket {
    /// Market id (bytes32 hex)
    pub id: String,
    pub loan_token: Asset,
    pub collateral_token: Asset,
    /// Liquidation LTV (WAD)
    pub lltv: U256,
    pub total_supply_assets: U256,
    pub total_borrow_assets: U256,
    /// Borrow rate per second (WAD)
    pub borrow_rate_per_second: U256,
    /// Share of interest taken as fee (WAD)
    pub fee: U256,
}

/// A user's position in one Morpho market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MorphoUserPosition {
    pub market_id: String,
    pub supply_assets: U256,
    pub borrow_assets: U256,
    pub collateral: U256,
}

// ============================================================================
// Compound III
// ============================================================================

/// Compound III (Comet) market: one base asset plus collateral assets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CometMarket {
    pub comet: Address,
    pub base: Asset,
    /// Supply rate per second (1e18)
    pub supply_rate_per_second: U256,
    /// Borrow rate per second (1e18)
    pub borrow_rate_per_second: U256,
    pub total_supply: U256,
    pub total_borrow: U256,
    pub is_supply_paused: bool,
    pub is_withdraw_paused: bool,
    pub collaterals: Vec<CometCollateral>,
}

/// Collateral asset accepted by a Comet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CometCollateral {
    pub asset: Asset,
    /// Borrow collateral factor (1e18)
    pub borrow_collateral_factor: U256,
    /// Liquidate collateral factor (1e18)
    pub liquidate_collateral_factor: U256,
    pub supply_cap: U256,
    pub total_supply: U256,
}

/// A user's account in one Comet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CometUserPosition {
    pub comet: Address,
    pub base_supply: U256,
    pub base_borrow: U256,
    pub collaterals: SmallVec<[CometUserCollateral; 4]>,
}

/// A user's collateral balance in a Comet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CometUserCollateral {
    pub asset: Address,
    pub balance: U256,
}

// ============================================================================
// Moonwell
// ============================================================================

/// Moonwell mToken market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoonwellMarket {
    pub comptroller: Address,
    pub m_token: Address,
    pub underlying: Asset,
    /// Collateral factor (1e18)
    pub collateral_factor: U256,
    /// Supply rate per timestamp (1e18)
    pub supply_rate_per_timestamp: U256,
    /// Borrow rate per timestamp (1e18)
    pub borrow_rate_per_timestamp: U256,
    /// Underlying held by the mToken
    pub cash: U256,
    pub mint_paused: bool,
    pub borrow_paused: bool,
}

/// A user's balances in one mToken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoonwellUserMarket {
    pub m_token: Address,
    /// Supplied balance in underlying units
    pub supply_underlying: U256,
    pub borrow_balance: U256,
    /// Whether the account entered this market as collateral
    pub entered: bool,
}
