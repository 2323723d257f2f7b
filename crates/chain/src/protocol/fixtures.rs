//! In-memory chain data source and sample records for adapter tests.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{Asset, ChainDataSource, Protocol, RawAccount, RawMarket, SourceError};

pub(crate) const E18: u128 = 1_000_000_000_000_000_000;

/// Canned protocol state.
#[derive(Debug, Default)]
pub(crate) struct MemorySource {
    pub markets: HashMap<Protocol, Vec<Result<RawMarket, SourceError>>>,
    pub accounts: HashMap<(Protocol, Address), RawAccount>,
    pub unreachable: Vec<Protocol>,
    pub delays: HashMap<Protocol, Duration>,
    pub calls: AtomicUsize,
}

impl MemorySource {
    pub fn with_market(mut self, raw: RawMarket) -> Self {
        self.markets.entry(raw.protocol()).or_default().push(Ok(raw));
        self
    }

    pub fn with_broken_market(mut self, protocol: Protocol, error: SourceError) -> Self {
        self.markets.entry(protocol).or_default().push(Err(error));
        self
    }

    pub fn with_account(mut self, owner: Address, account: RawAccount) -> Self {
        self.accounts.insert((account.protocol(), owner), account);
        self
    }

    pub fn unreachable(mut self, protocol: Protocol) -> Self {
        self.unreachable.push(protocol);
        self
    }

    pub fn delayed(mut self, protocol: Protocol, delay: Duration) -> Self {
        self.delays.insert(protocol, delay);
        self
    }

    async fn enter(&self, protocol: Protocol) -> Result<(), SourceError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delays.get(&protocol) {
            tokio::time::sleep(*delay).await;
        }
        if self.unreachable.contains(&protocol) {
            return Err(SourceError::Connectivity(format!("{protocol} rpc down")));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainDataSource for MemorySource {
    async fn fetch_markets(
        &self,
        protocol: Protocol,
    ) -> Result<Vec<Result<RawMarket, SourceError>>, SourceError> {
        self.enter(protocol).await?;
        Ok(self.markets.get(&protocol).cloned().unwrap_or_default())
    }

    async fn fetch_account(
        &self,
        protocol: Protocol,
        owner: Address,
    ) -> Result<RawAccount, SourceError> {
        self.enter(protocol).await?;
        Ok(self
            .accounts
            .get(&(protocol, owner))
            .cloned()
            .unwrap_or_else(|| RawAccount::empty(protocol)))
    }
}

pub(crate) fn usdc() -> Asset {
    Asset::new("USDC", 6, Address::repeat_byte(0x11))
}

pub(crate) fn weth() -> Asset {
    Asset::new("WETH", 18, Address::repeat_byte(0x22))
}

pub(crate) fn owner() -> Address {
    Address::repeat_byte(0xaa)
}

/// `value` scaled by 1e18 (mantissa / WAD).
pub(crate) fn wad(value: f64) -> U256 {
    U256::from((value * E18 as f64).round() as u128)
}

/// `value` scaled by 1e27.
pub(crate) fn ray(value: f64) -> U256 {
    wad(value) * U256::from(1_000_000_000u64)
}
