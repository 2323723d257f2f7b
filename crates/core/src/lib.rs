//! Lending risk engine core.
//!
//! This crate turns per-protocol positions into risk figures:
//! - Position normalization into one canonical set
//! - Health factor calculation, simulation and risk tiers
//! - Portfolio aggregation
//! - Supply/borrow routing across markets
//! - Liquidation monitoring with tier-transition alerts
//!
//! Supports Aave V3, Morpho Blue, Compound III and Moonwell through the
//! adapters in `lendscope-chain`.

mod aggregator;
pub mod config;
mod engine;
mod error;
mod health;
mod monitor;
mod normalizer;
mod routing;

#[cfg(test)]
mod testing;

pub use aggregator::{aggregate, aggregate_report, PortfolioReport, PortfolioStats};
pub use config::{EngineConfig, MonitorConfig, PriceConfig};
pub use engine::LendingEngine;
pub use error::{EngineError, EngineResult};
pub use health::{
    health_factor, position_health_factor, simulate_health_factor, simulate_position, Action,
    MarginAccount, RiskTier, Simulation,
};
pub use monitor::{
    AlertKind, AlertSink, AlertSinkError, LiquidationMonitor, RiskAlert, TickReport, TierTracker,
    TracingAlertSink,
};
pub use normalizer::{normalize, DomainKey, DomainMembers, PositionSet};
pub use routing::{rank, recommend, RoutingConfig, RoutingOption};
