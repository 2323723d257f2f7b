//! Price quote types.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::math::{self, PRICE_DECIMALS};

/// USD price for an asset, 8 decimals, with the time it was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    /// Price value (8 decimals)
    pub price: U256,
    /// Unix timestamp (seconds) the price refers to
    pub as_of: u64,
}

impl PriceQuote {
    /// Create a new quote.
    pub fn new(price: U256, as_of: u64) -> Self {
        Self { price, as_of }
    }

    /// Build a quote from a floating USD price (e.g. an HTTP API answer).
    pub fn from_usd(price_usd: f64, as_of: u64) -> Result<Self, PriceError> {
        if !price_usd.is_finite() || price_usd <= 0.0 {
            return Err(PriceError::Invalid(format!("non-positive price {price_usd}")));
        }
        let scaled = (price_usd * 10f64.powi(PRICE_DECIMALS as i32)).round();
        Ok(Self::new(U256::from(scaled as u128), as_of))
    }

    /// Get price as f64 (display only).
    pub fn price_f64(&self) -> f64 {
        math::units_to_f64(self.price, PRICE_DECIMALS)
    }

    /// Get age in seconds.
    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.as_of)
    }

    /// Check if the quote is older than `max_age_secs`.
    pub fn is_stale(&self, max_age_secs: u64, now: u64) -> bool {
        self.age_secs(now) > max_age_secs
    }
}

/// Reasons a price cannot be used.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PriceError {
    #[error("no price for asset {0}")]
    Missing(Address),

    #[error("price for {asset} is {age_secs}s old (max {max_secs}s)")]
    Stale {
        asset: Address,
        age_secs: u64,
        max_secs: u64,
    },

    #[error("invalid price: {0}")]
    Invalid(String),

    #[error("price feed unavailable: {0}")]
    Unavailable(String),
}
