//! Concurrent, cancellable refresh across protocol adapters.

use alloy::primitives::Address;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use super::{
    AaveV3Adapter, ChainDataSource, CompoundV3Adapter, FetchBatch, MarketParams, MoonwellAdapter,
    MorphoBlueAdapter, Position, Protocol, ProtocolAdapter, SourceError,
};
use crate::cancel::CancelSignal;

/// Fan-out limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum adapters queried at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-adapter deadline in milliseconds
    #[serde(default = "default_adapter_timeout_ms")]
    pub adapter_timeout_ms: u64,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_adapter_timeout_ms() -> u64 {
    10_000
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            adapter_timeout_ms: default_adapter_timeout_ms(),
        }
    }
}

/// Outcome of one refresh across every registered protocol.
#[derive(Debug)]
pub struct ProtocolSweep<T> {
    /// Per-protocol outcome, ordered by protocol
    outcomes: Vec<(Protocol, Result<FetchBatch<T>, SourceError>)>,
}

impl<T> ProtocolSweep<T> {
    /// Per-protocol outcomes, ordered by protocol.
    pub fn outcomes(&self) -> &[(Protocol, Result<FetchBatch<T>, SourceError>)] {
        &self.outcomes
    }

    /// Whether every adapter answered and every entry translated.
    pub fn is_complete(&self) -> bool {
        self.outcomes
            .iter()
            .all(|(_, outcome)| matches!(outcome, Ok(batch) if batch.is_complete()))
    }

    /// Successfully translated items, across protocols.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.outcomes
            .iter()
            .filter_map(|(_, outcome)| outcome.as_ref().ok())
            .flat_map(|batch| batch.items.iter())
    }

    /// Consume the sweep, keeping only the translated items.
    pub fn into_items(self) -> Vec<T> {
        self.outcomes
            .into_iter()
            .filter_map(|(_, outcome)| outcome.ok())
            .flat_map(|batch| batch.items)
            .collect()
    }

    /// Human-readable list of everything that went wrong.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (protocol, outcome) in &self.outcomes {
            match outcome {
                Ok(batch) => problems.extend(batch.failures.iter().map(|f| f.to_string())),
                Err(e) => problems.push(format!("{protocol}: {e}")),
            }
        }
        problems
    }
}

impl ProtocolSweep<MarketParams> {
    /// Every token a translated market lends or takes as collateral.
    pub fn assets(&self) -> BTreeSet<Address> {
        self.items()
            .flat_map(|market| {
                std::iter::once(market.asset.address)
                    .chain(market.loan_token.as_ref().map(|a| a.address))
                    .chain(market.collateral_token.as_ref().map(|a| a.address))
            })
            .collect()
    }
}

/// The set of adapters queried on every refresh.
#[derive(Debug, Clone)]
pub struct AdapterSet {
    adapters: Vec<Arc<dyn ProtocolAdapter>>,
    config: FetchConfig,
}

impl AdapterSet {
    /// Create an empty set.
    pub fn new(config: FetchConfig) -> Self {
        Self {
            adapters: Vec::new(),
            config,
        }
    }

    /// Register one adapter per protocol, all reading from `source`.
    pub fn with_default_adapters(source: Arc<dyn ChainDataSource>, config: FetchConfig) -> Self {
        Self::new(config)
            .with_adapter(Arc::new(AaveV3Adapter::new(source.clone())))
            .with_adapter(Arc::new(MorphoBlueAdapter::new(source.clone())))
            .with_adapter(Arc::new(CompoundV3Adapter::new(source.clone())))
            .with_adapter(Arc::new(MoonwellAdapter::new(source)))
    }

    /// Register an adapter, replacing any previous one for the same protocol.
    pub fn with_adapter(mut self, adapter: Arc<dyn ProtocolAdapter>) -> Self {
        let protocol = adapter.protocol();
        self.adapters.retain(|a| a.protocol() != protocol);
        self.adapters.push(adapter);
        self
    }

    /// Protocols with a registered adapter.
    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols: Vec<_> = self.adapters.iter().map(|a| a.protocol()).collect();
        protocols.sort();
        protocols
    }

    /// Fan-out limits in use.
    pub fn config(&self) -> FetchConfig {
        self.config
    }

    /// Fetch an owner's positions from every protocol.
    #[instrument(skip(self, cancel), fields(owner = %owner))]
    pub async fn refresh_positions(
        &self,
        owner: Address,
        cancel: &CancelSignal,
    ) -> Result<ProtocolSweep<Position>, SourceError> {
        self.sweep(cancel, |adapter| adapter.fetch_positions(owner))
            .await
    }

    /// Fetch every market from every protocol.
    #[instrument(skip(self, cancel))]
    pub async fn refresh_markets(
        &self,
        cancel: &CancelSignal,
    ) -> Result<ProtocolSweep<MarketParams>, SourceError> {
        self.sweep(cancel, |adapter| adapter.fetch_markets()).await
    }

    /// Run `call` on every adapter with bounded concurrency.
    ///
    /// Each adapter gets its own deadline. If `cancel` fires, in-flight calls
    /// are dropped and nothing is returned.
    async fn sweep<'a, T, F>(
        &'a self,
        cancel: &CancelSignal,
        call: F,
    ) -> Result<ProtocolSweep<T>, SourceError>
    where
        T: Send + 'a,
        F: Fn(&'a dyn ProtocolAdapter) -> BoxFuture<'a, Result<FetchBatch<T>, SourceError>>,
    {
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }

        let started = Instant::now();
        let timeout_ms = self.config.adapter_timeout_ms;
        let deadline = Duration::from_millis(timeout_ms);

        let calls: Vec<_> = self
            .adapters
            .iter()
            .map(|adapter| {
                let protocol = adapter.protocol();
                let fut = call(adapter.as_ref());
                async move {
                    let outcome = match tokio::time::timeout(deadline, fut).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(SourceError::Timeout(timeout_ms)),
                    };
                    (protocol, outcome)
                }
            })
            .collect();

        let collected = stream::iter(calls)
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect::<Vec<_>>();

        let mut outcomes = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Refresh cancelled, discarding partial results");
                return Err(SourceError::Cancelled);
            }
            outcomes = collected => outcomes,
        };

        outcomes.sort_by_key(|(protocol, _)| *protocol);

        for (protocol, outcome) in &outcomes {
            match outcome {
                Ok(batch) if !batch.is_complete() => warn!(
                    protocol = %protocol,
                    failures = batch.failures.len(),
                    "Adapter returned a degraded batch"
                ),
                Ok(_) => {}
                Err(e) => warn!(protocol = %protocol, error = %e, "Adapter refresh failed"),
            }
        }

        debug!(
            adapters = outcomes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Protocol sweep finished"
        );

        Ok(ProtocolSweep { outcomes })
    }
}
