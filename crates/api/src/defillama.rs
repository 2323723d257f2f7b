//! DefiLlama coins API client (current USD prices).

use alloy::primitives::Address;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lendscope_chain::{PriceError, PriceFeed, PriceQuote};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Assets per request, keeps the URL comfortably short.
const MAX_COINS_PER_REQUEST: usize = 50;

/// DefiLlama price client.
#[derive(Debug, Clone)]
pub struct DefiLlamaClient {
    client: reqwest::Client,
    base_url: String,
    /// Chain slug used in coin ids (e.g. "ethereum", "base")
    chain: String,
    /// How far back DefiLlama may look for a price (e.g. "4h")
    search_width: Option<String>,
}

impl DefiLlamaClient {
    /// Create a client for a chain slug.
    pub fn new(chain: impl Into<String>) -> Self {
        Self::with_base_url("https://coins.llama.fi", chain)
    }

    /// Create a client with a custom base URL.
    pub fn with_base_url(base_url: impl Into<String>, chain: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into(),
            chain: chain.into(),
            search_width: None,
        }
    }

    /// Set the lookback window DefiLlama may use.
    pub fn with_search_width(mut self, width: impl Into<String>) -> Self {
        self.search_width = Some(width.into());
        self
    }

    /// Chain slug this client prices on.
    pub fn chain(&self) -> &str {
        &self.chain
    }

    fn coin_id(&self, asset: &Address) -> String {
        format!("{}:{}", self.chain, asset)
    }

    /// Fetch current prices for one chunk of assets.
    async fn fetch_chunk(&self, assets: &[Address]) -> Result<PricesResponse> {
        let coins = assets
            .iter()
            .map(|a| self.coin_id(a))
            .collect::<Vec<_>>()
            .join(",");
        let url = format!("{}/prices/current/{}", self.base_url, coins);

        let mut request = self.client.get(&url);
        if let Some(width) = &self.search_width {
            request = request.query(&[("searchWidth", width.as_str())]);
        }

        let response = request.send().await.context("defillama request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("defillama returned HTTP {status}");
        }

        response
            .json::<PricesResponse>()
            .await
            .context("defillama response did not decode")
    }
}

#[async_trait]
impl PriceFeed for DefiLlamaClient {
    #[instrument(skip(self, assets), fields(chain = %self.chain, assets = assets.len()))]
    async fn fetch_prices(
        &self,
        assets: &[Address],
    ) -> Result<HashMap<Address, PriceQuote>, PriceError> {
        let mut quotes = HashMap::with_capacity(assets.len());

        for chunk in assets.chunks(MAX_COINS_PER_REQUEST) {
            let response = self
                .fetch_chunk(chunk)
                .await
                .map_err(|e| PriceError::Unavailable(format!("{e:#}")))?;
            quotes.extend(response.into_quotes(&self.chain));
        }

        debug!(priced = quotes.len(), "Fetched DefiLlama prices");
        Ok(quotes)
    }
}

/// `/prices/current` response body.
#[derive(Debug, Deserialize)]
struct PricesResponse {
    coins: HashMap<String, CoinPrice>,
}

#[derive(Debug, Deserialize)]
struct CoinPrice {
    price: f64,
    timestamp: u64,
    #[serde(default)]
    symbol: Option<String>,
}

impl PricesResponse {
    /// Convert coin entries into quotes, skipping anything unusable.
    fn into_quotes(self, chain: &str) -> Vec<(Address, PriceQuote)> {
        self.coins
            .into_iter()
            .filter_map(|(id, coin)| {
                let (coin_chain, address) = id.split_once(':')?;
                if coin_chain != chain {
                    return None;
                }
                let address: Address = match address.parse() {
                    Ok(address) => address,
                    Err(_) => {
                        warn!(coin = %id, "Unparseable coin id in DefiLlama response");
                        return None;
                    }
                };
                match PriceQuote::from_usd(coin.price, coin.timestamp) {
                    Ok(quote) => Some((address, quote)),
                    Err(e) => {
                        warn!(
                            coin = %id,
                            symbol = coin.symbol.as_deref().unwrap_or("?"),
                            error = %e,
                            "Dropping DefiLlama price"
                        );
                        None
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    const SAMPLE: &str = r#"{
        "coins": {
            "ethereum:0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48": {
                "decimals": 6,
                "symbol": "USDC",
                "price": 0.9998,
                "timestamp": 1700000000,
                "confidence": 0.99
            },
            "ethereum:0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2": {
                "decimals": 18,
                "symbol": "WETH",
                "price": 2000.5,
                "timestamp": 1700000010,
                "confidence": 0.99
            },
            "ethereum:not-an-address": {
                "price": 1.0,
                "timestamp": 1700000000
            },
            "ethereum:0x0000000000000000000000000000000000000001": {
                "price": 0.0,
                "timestamp": 1700000000
            }
        }
    }"#;

    #[test]
    fn test_parses_coin_prices() {
        let response: PricesResponse = serde_json::from_str(SAMPLE).unwrap();
        let quotes: HashMap<_, _> = response.into_quotes("ethereum").into_iter().collect();

        assert_eq!(quotes.len(), 2);

        let weth: Address = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2".parse().unwrap();
        let quote = quotes[&weth];
        assert_eq!(quote.price, U256::from(200_050_000_000u64));
        assert_eq!(quote.as_of, 1_700_000_010);
    }

    #[test]
    fn test_ignores_other_chains() {
        let response: PricesResponse = serde_json::from_str(SAMPLE).unwrap();
        assert!(response.into_quotes("base").is_empty());
    }

    #[test]
    fn test_coin_id_format() {
        let client = DefiLlamaClient::new("base");
        assert_eq!(
            client.coin_id(&Address::ZERO),
            "base:0x0000000000000000000000000000000000000000"
        );
    }

    #[tokio::test]
    #[ignore] // Requires network
    async fn test_live_prices() {
        let client = DefiLlamaClient::new("ethereum").with_search_width("4h");
        let weth: Address = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2".parse().unwrap();

        let quotes = client.fetch_prices(&[weth]).await.unwrap();
        assert!(quotes[&weth].price_f64() > 0.0);
    }
}
