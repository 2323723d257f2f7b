//! Price lookup abstraction.
//!
//! The engine never caches prices itself: every USD computation asks a
//! [`PriceLookup`] for the live quote and must reject stale data.
//!
//! - [`PriceLookup`]: synchronous read of the latest known quote for an asset
//! - [`PriceFeed`]: async upstream source used to refresh a [`PriceBook`]
//! - [`PriceBook`]: concurrent cache with staleness enforcement

mod book;
mod types;

pub use book::PriceBook;
pub use types::{PriceError, PriceQuote};

use alloy::primitives::Address;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;

/// Read access to live USD prices (8 decimals).
pub trait PriceLookup: Send + Sync {
    /// Get the current quote for an asset.
    ///
    /// Implementations must return [`PriceError::Stale`] instead of an old quote.
    fn price(&self, asset: &Address) -> Result<PriceQuote, PriceError>;
}

/// Upstream price source (HTTP API, on-chain oracle reader, ...).
#[async_trait]
pub trait PriceFeed: Send + Sync + Debug {
    /// Fetch quotes for the given assets. Assets the feed cannot price are
    /// simply absent from the returned map.
    async fn fetch_prices(
        &self,
        assets: &[Address],
    ) -> Result<HashMap<Address, PriceQuote>, PriceError>;
}

impl<T: PriceLookup + ?Sized> PriceLookup for std::sync::Arc<T> {
    fn price(&self, asset: &Address) -> Result<PriceQuote, PriceError> {
        (**self).price(asset)
    }
}

impl PriceLookup for HashMap<Address, PriceQuote> {
    fn price(&self, asset: &Address) -> Result<PriceQuote, PriceError> {
        self.get(asset).copied().ok_or(PriceError::Missing(*asset))
    }
}
