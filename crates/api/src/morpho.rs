//! Morpho Blue GraphQL API client.
//!
//! Serves Morpho markets and account positions as a [`ChainDataSource`],
//! so the Morpho adapter can run without an archive RPC.

use alloy::primitives::{Address, U256};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use lendscope_chain::math::{fraction_to_wad, SECONDS_PER_YEAR};
use lendscope_chain::protocol::{MorphoMarket, MorphoUserPosition};
use lendscope_chain::{Asset, ChainDataSource, Protocol, RawAccount, RawMarket, SourceError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const MARKETS_QUERY: &str = r#"
query Markets($chainId: Int!, $first: Int!, $skip: Int!) {
  markets(first: $first, skip: $skip, where: { chainId_in: [$chainId], whitelisted: true }) {
    items {
      uniqueKey
      lltv
      loanAsset { address symbol decimals }
      collateralAsset { address symbol decimals }
      state { supplyAssets borrowAssets fee borrowApy }
    }
    pageInfo { countTotal }
  }
}"#;

const POSITIONS_QUERY: &str = r#"
query Positions($address: String!, $chainId: Int!) {
  userByAddress(address: $address, chainId: $chainId) {
    marketPositions {
      market { uniqueKey }
      state { supplyAssets borrowAssets collateral }
    }
  }
}"#;

const PAGE_SIZE: usize = 100;

/// Cached market list with timestamp for TTL expiration.
#[derive(Clone)]
struct CachedMarkets {
    markets: Arc<Vec<Result<RawMarket, SourceError>>>,
    cached_at: Instant,
}

/// Morpho Blue API client with a short-lived market cache.
#[derive(Clone)]
pub struct MorphoApiClient {
    client: reqwest::Client,
    base_url: String,
    chain_id: u64,
    /// Market list cache by chain id
    cache: Arc<DashMap<u64, CachedMarkets>>,
    cache_ttl: Duration,
}

impl std::fmt::Debug for MorphoApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MorphoApiClient")
            .field("base_url", &self.base_url)
            .field("chain_id", &self.chain_id)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl MorphoApiClient {
    /// Create a client for a chain (1 = Ethereum, 8453 = Base).
    pub fn new(chain_id: u64) -> Self {
        Self::with_base_url("https://blue-api.morpho.org/graphql", chain_id)
    }

    /// Create a client with a custom endpoint.
    pub fn with_base_url(base_url: impl Into<String>, chain_id: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into(),
            chain_id,
            cache: Arc::new(DashMap::new()),
            cache_ttl: Duration::from_secs(30),
        }
    }

    /// Set how long a fetched market list is reused.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Run a GraphQL query and decode its `data` field.
    async fn query<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<GraphQlResponse<T>> {
        let response = self
            .client
            .post(&self.base_url)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .context("morpho api request failed")?;

        let status = response.status();
        if !status.is_success() {
            bail!("morpho api returned HTTP {status}");
        }

        response
            .json::<GraphQlResponse<T>>()
            .await
            .map_err(|e| anyhow!(MalformedBody(e.to_string())))
    }

    /// Fetch every whitelisted market, following pagination.
    async fn fetch_all_markets(&self) -> Result<Vec<Result<RawMarket, SourceError>>> {
        let mut markets = Vec::new();
        let mut skip = 0usize;

        loop {
            let response: GraphQlResponse<MarketsData> = self
                .query(
                    MARKETS_QUERY,
                    json!({ "chainId": self.chain_id, "first": PAGE_SIZE, "skip": skip }),
                )
                .await?;
            let page = response.into_data()?.markets;

            let fetched = page.items.len();
            markets.extend(page.items.into_iter().filter_map(ApiMarket::into_raw));

            debug!(
                skip = skip,
                fetched = fetched,
                total = page.page_info.count_total,
                "Fetched morpho market page"
            );

            skip += fetched;
            if fetched < PAGE_SIZE || skip >= page.page_info.count_total {
                break;
            }
        }

        Ok(markets)
    }

    fn ensure_morpho(protocol: Protocol) -> Result<(), SourceError> {
        if protocol == Protocol::Morpho {
            Ok(())
        } else {
            Err(SourceError::Malformed(format!(
                "{protocol} is not served by the morpho api"
            )))
        }
    }
}

#[async_trait]
impl ChainDataSource for MorphoApiClient {
    #[instrument(skip(self), fields(chain_id = self.chain_id))]
    async fn fetch_markets(
        &self,
        protocol: Protocol,
    ) -> Result<Vec<Result<RawMarket, SourceError>>, SourceError> {
        Self::ensure_morpho(protocol)?;

        if let Some(cached) = self.cache.get(&self.chain_id) {
            if cached.cached_at.elapsed() < self.cache_ttl {
                return Ok(cached.markets.as_ref().clone());
            }
        }

        let markets = self.fetch_all_markets().await.map_err(to_source_error)?;
        info!(markets = markets.len(), "Fetched morpho markets");

        self.cache.insert(
            self.chain_id,
            CachedMarkets {
                markets: Arc::new(markets.clone()),
                cached_at: Instant::now(),
            },
        );
        Ok(markets)
    }

    #[instrument(skip(self), fields(chain_id = self.chain_id, owner = %owner))]
    async fn fetch_account(
        &self,
        protocol: Protocol,
        owner: Address,
    ) -> Result<RawAccount, SourceError> {
        Self::ensure_morpho(protocol)?;

        let response: GraphQlResponse<UserData> = self
            .query(
                POSITIONS_QUERY,
                json!({ "address": owner.to_string(), "chainId": self.chain_id }),
            )
            .await
            .map_err(to_source_error)?;

        // The API answers NOT_FOUND for addresses that never touched Morpho
        if response.is_not_found() {
            return Ok(RawAccount::empty(Protocol::Morpho));
        }

        let user = response.into_data().map_err(to_source_error)?.user_by_address;
        let positions = user
            .map(|u| u.market_positions)
            .unwrap_or_default()
            .into_iter()
            .map(|p| MorphoUserPosition {
                market_id: p.market.unique_key,
                supply_assets: p.state.supply_assets,
                borrow_assets: p.state.borrow_assets,
                collateral: p.state.collateral,
            })
            .collect();

        Ok(RawAccount::Morpho { positions })
    }
}

/// Marker for bodies that arrived but could not be decoded.
#[derive(Debug)]
struct MalformedBody(String);

impl std::fmt::Display for MalformedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "undecodable morpho api body: {}", self.0)
    }
}

impl std::error::Error for MalformedBody {}

fn to_source_error(e: anyhow::Error) -> SourceError {
    if e.downcast_ref::<MalformedBody>().is_some() || e.downcast_ref::<GraphQlErrors>().is_some() {
        SourceError::Malformed(format!("{e:#}"))
    } else {
        SourceError::Connectivity(format!("{e:#}"))
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug)]
struct GraphQlErrors(Vec<GraphQlError>);

impl std::fmt::Display for GraphQlErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let messages: Vec<_> = self.0.iter().map(|e| e.message.as_str()).collect();
        write!(f, "graphql errors: {}", messages.join("; "))
    }
}

impl std::error::Error for GraphQlErrors {}

impl<T> GraphQlResponse<T> {
    fn is_not_found(&self) -> bool {
        self.errors
            .iter()
            .any(|e| e.status.as_deref() == Some("NOT_FOUND"))
    }

    fn into_data(self) -> Result<T> {
        if !self.errors.is_empty() {
            return Err(anyhow!(GraphQlErrors(self.errors)));
        }
        self.data
            .ok_or_else(|| anyhow!(GraphQlErrors(Vec::new())))
    }
}

#[derive(Debug, Deserialize)]
struct MarketsData {
    markets: MarketPage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketPage {
    items: Vec<ApiMarket>,
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    count_total: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiAsset {
    address: Address,
    symbol: String,
    decimals: u8,
}

impl From<ApiAsset> for Asset {
    fn from(a: ApiAsset) -> Self {
        Asset::new(a.symbol, a.decimals, a.address)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiMarket {
    unique_key: String,
    #[serde(deserialize_with = "big_int")]
    lltv: U256,
    loan_asset: ApiAsset,
    collateral_asset: Option<ApiAsset>,
    state: Option<ApiMarketState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiMarketState {
    #[serde(deserialize_with = "big_int")]
    supply_assets: U256,
    #[serde(deserialize_with = "big_int")]
    borrow_assets: U256,
    /// Fee as a fraction of interest
    fee: f64,
    borrow_apy: f64,
}

impl ApiMarket {
    /// Convert to a raw market. Idle markets (no collateral) are skipped.
    fn into_raw(self) -> Option<Result<RawMarket, SourceError>> {
        let Some(collateral) = self.collateral_asset else {
            debug!(market = %self.unique_key, "Skipping idle morpho market");
            return None;
        };

        let Some(state) = self.state else {
            warn!(market = %self.unique_key, "Morpho market without state");
            return Some(Err(SourceError::Malformed(format!(
                "market {} has no state",
                self.unique_key
            ))));
        };

        if !state.borrow_apy.is_finite() || state.borrow_apy < 0.0 {
            return Some(Err(SourceError::Malformed(format!(
                "market {} borrow apy {}",
                self.unique_key, state.borrow_apy
            ))));
        }

        // The API quotes continuously compounded APY; recover the per-second rate
        let rate_per_second = (1.0 + state.borrow_apy).ln() / SECONDS_PER_YEAR;

        Some(Ok(RawMarket::Morpho(MorphoMarket {
            id: self.unique_key,
            loan_token: self.loan_asset.into(),
            collateral_token: collateral.into(),
            lltv: self.lltv,
            total_supply_assets: state.supply_assets,
            total_borrow_assets: state.borrow_assets,
            borrow_rate_per_second: fraction_to_wad(rate_per_second),
            fee: fraction_to_wad(state.fee),
        })))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserData {
    user_by_address: Option<ApiUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiUser {
    #[serde(default)]
    market_positions: Vec<ApiPosition>,
}

#[derive(Debug, Deserialize)]
struct ApiPosition {
    market: ApiMarketRef,
    state: ApiPositionState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiMarketRef {
    unique_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiPositionState {
    #[serde(deserialize_with = "big_int")]
    supply_assets: U256,
    #[serde(deserialize_with = "big_int")]
    borrow_assets: U256,
    #[serde(deserialize_with = "big_int")]
    collateral: U256,
}

/// BigInt scalars arrive either as JSON numbers or as decimal strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum BigIntRepr {
    Text(String),
    Integer(u64),
    Float(f64),
}

fn big_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
    match Option::<BigIntRepr>::deserialize(deserializer)? {
        Some(BigIntRepr::Text(s)) => U256::from_str_radix(&s, 10).map_err(serde::de::Error::custom),
        Some(BigIntRepr::Integer(n)) => Ok(U256::from(n)),
        Some(BigIntRepr::Float(f)) if f.is_finite() && f >= 0.0 => Ok(U256::from(f as u128)),
        Some(BigIntRepr::Float(f)) => Err(serde::de::Error::custom(format!("invalid bigint {f}"))),
        None => Ok(U256::ZERO),
    }
}
