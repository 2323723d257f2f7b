//! Price cache with staleness enforcement.

use alloy::primitives::Address;
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use super::{PriceError, PriceFeed, PriceLookup, PriceQuote};

/// Concurrent price cache keyed by asset address.
///
/// The book stores whatever the upstream feed reported, including the
/// observation time, and refuses to hand out quotes older than
/// `max_staleness_secs`. A stale quote is an error, never a fallback.
#[derive(Debug)]
pub struct PriceBook {
    /// Price cache by asset address
    prices: DashMap<Address, PriceQuote>,
    /// Maximum accepted quote age
    max_staleness_secs: u64,
}

impl PriceBook {
    /// Create an empty price book.
    pub fn new(max_staleness_secs: u64) -> Self {
        Self {
            prices: DashMap::new(),
            max_staleness_secs,
        }
    }

    /// Maximum accepted quote age in seconds.
    pub fn max_staleness_secs(&self) -> u64 {
        self.max_staleness_secs
    }

    /// Insert or replace a quote. Older quotes never overwrite newer ones.
    pub fn update(&self, asset: Address, quote: PriceQuote) {
        let mut entry = self.prices.entry(asset).or_insert(quote);
        if quote.as_of >= entry.as_of {
            *entry = quote;
        } else {
            debug!(asset = %asset, as_of = quote.as_of, "Ignoring out-of-order price update");
        }
    }

    /// Get a quote, checking staleness against an explicit `now`.
    pub fn price_at(&self, asset: &Address, now: u64) -> Result<PriceQuote, PriceError> {
        let quote = self
            .prices
            .get(asset)
            .map(|q| *q)
            .ok_or(PriceError::Missing(*asset))?;

        if quote.is_stale(self.max_staleness_secs, now) {
            return Err(PriceError::Stale {
                asset: *asset,
                age_secs: quote.age_secs(now),
                max_secs: self.max_staleness_secs,
            });
        }

        Ok(quote)
    }

    /// Check if we hold any quote (fresh or not) for an asset.
    pub fn has_price(&self, asset: &Address) -> bool {
        self.prices.contains_key(asset)
    }

    /// Get number of cached prices.
    pub fn len(&self) -> usize {
        self.prices.len()
    }

    /// Whether the book is empty.
    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    /// Assets whose quote is older than the staleness bound.
    pub fn stale_assets(&self, now: u64) -> Vec<Address> {
        self.prices
            .iter()
            .filter(|e| e.value().is_stale(self.max_staleness_secs, now))
            .map(|e| *e.key())
            .collect()
    }

    /// Pull fresh quotes from an upstream feed.
    ///
    /// Returns the number of assets updated. Assets the feed did not price
    /// keep their previous quote and will eventually fail the staleness check.
    #[instrument(skip(self, feed, assets), fields(requested = assets.len()))]
    pub async fn refresh_from(
        &self,
        feed: &dyn PriceFeed,
        assets: &[Address],
    ) -> Result<usize, PriceError> {
        let quotes = feed.fetch_prices(assets).await?;
        let updated = quotes.len();

        for (asset, quote) in quotes {
            self.update(asset, quote);
        }

        if updated < assets.len() {
            warn!(
                requested = assets.len(),
                updated = updated,
                "Price feed returned partial results"
            );
        } else {
            info!(updated = updated, "Price book refreshed");
        }

        Ok(updated)
    }
}

impl PriceLookup for PriceBook {
    fn price(&self, asset: &Address) -> Result<PriceQuote, PriceError> {
        self.price_at(asset, now_secs())
    }
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
