//! Liquidation monitor.
//!
//! One ticker drives the whole tracked owner set:
//! - Refresh every owner's positions concurrently (bounded)
//! - Evaluate health factors against live prices
//! - Feed each position through the [`TierTracker`] transition
//! - Deliver the resulting alerts to an [`AlertSink`]
//!
//! An owner whose refresh is incomplete changes nothing; a tick cancelled
//! while refreshing changes nothing at all. An alert that could not be
//! delivered, because the sink failed or the tick was cancelled while
//! waiting on it, rolls its position back to the previous tier and is raised
//! again on the next tick.

use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use lendscope_chain::{
    AdapterSet, CancelSignal, MarketId, PositionKey, PriceError, PriceLookup, Protocol,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::config::MonitorConfig;
use crate::error::{EngineError, EngineResult};
use crate::health::{MarginAccount, RiskTier};
use crate::normalizer::{normalize, PositionSet};

/// Why an alert was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    /// Moved to a worse tier
    Escalation,
    /// Observed below 1.0 (repeated on every poll)
    Liquidatable,
    /// Moved to a better tier
    Recovery,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Escalation => "escalation",
            Self::Liquidatable => "liquidatable",
            Self::Recovery => "recovery",
        })
    }
}

/// A tier transition of one position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAlert {
    pub kind: AlertKind,
    pub owner: Address,
    pub protocol: Protocol,
    pub market_id: MarketId,
    pub previous_tier: RiskTier,
    pub new_tier: RiskTier,
    pub health_factor: f64,
    pub timestamp: DateTime<Utc>,
}

impl RiskAlert {
    /// Position the alert is about.
    pub fn key(&self) -> PositionKey {
        PositionKey {
            owner: self.owner,
            protocol: self.protocol,
            market_id: self.market_id.clone(),
        }
    }

    /// Identity for consumers deduplicating redelivered alerts.
    pub fn dedup_key(&self) -> (Address, Protocol, MarketId, RiskTier, DateTime<Utc>) {
        (
            self.owner,
            self.protocol,
            self.market_id.clone(),
            self.new_tier,
            self.timestamp,
        )
    }
}

/// Last reported tier per position, with the transition rules.
#[derive(Debug, Clone, Default)]
pub struct TierTracker {
    tiers: HashMap<PositionKey, RiskTier>,
    /// Margin by which an improvement must clear a better tier's edge
    recovery_hysteresis: f64,
}

impl TierTracker {
    /// Start from `tiers`, which may be pre-seeded from a previous run.
    pub fn new(tiers: HashMap<PositionKey, RiskTier>, recovery_hysteresis: f64) -> Self {
        Self {
            tiers,
            recovery_hysteresis: recovery_hysteresis.max(0.0),
        }
    }

    /// Stored tier of a position.
    pub fn tier(&self, key: &PositionKey) -> Option<RiskTier> {
        self.tiers.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Record an observation and return the alert it triggers, if any.
    ///
    /// The first observation of a position only records its tier.
    pub fn observe(&mut self, key: &PositionKey, hf: f64, now: DateTime<Utc>) -> Option<RiskAlert> {
        let observed = RiskTier::from_health_factor(hf);

        let Some(previous) = self.tier(key) else {
            self.tiers.insert(key.clone(), observed);
            return None;
        };

        let (kind, new_tier) = if observed == RiskTier::Liquidatable {
            (AlertKind::Liquidatable, observed)
        } else if observed > previous {
            (AlertKind::Escalation, observed)
        } else if observed == previous {
            return None;
        } else {
            // Repaid debt always recovers. Otherwise the HF, less the
            // hysteresis margin, must still land in a better tier; the stored
            // and reported tier is the observed one either way.
            if observed != RiskTier::None
                && RiskTier::from_health_factor(hf - self.recovery_hysteresis) >= previous
            {
                return None;
            }
            (AlertKind::Recovery, observed)
        };

        self.tiers.insert(key.clone(), new_tier);

        Some(RiskAlert {
            kind,
            owner: key.owner,
            protocol: key.protocol,
            market_id: key.market_id.clone(),
            previous_tier: previous,
            new_tier,
            health_factor: hf,
            timestamp: now,
        })
    }

    /// Put back the tier an undelivered alert replaced, so the next
    /// observation raises it again.
    pub fn revert(&mut self, alert: &RiskAlert) {
        self.tiers.insert(alert.key(), alert.previous_tier);
    }

    /// Drop an owner's positions that are no longer live. Silent.
    pub fn retain_owner(&mut self, owner: Address, live: &HashSet<PositionKey>) {
        self.tiers
            .retain(|key, _| key.owner != owner || live.contains(key));
    }

    /// Drop every position of an owner.
    pub fn forget_owner(&mut self, owner: Address) {
        self.tiers.retain(|key, _| key.owner != owner);
    }
}

/// Alert delivery failed.
#[derive(Debug, Error)]
pub enum AlertSinkError {
    #[error("alert receiver closed")]
    Closed,
}

/// Consumer of risk alerts. Delivery is at-least-once.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: RiskAlert) -> Result<(), AlertSinkError>;
}

#[async_trait]
impl AlertSink for mpsc::Sender<RiskAlert> {
    async fn deliver(&self, alert: RiskAlert) -> Result<(), AlertSinkError> {
        self.send(alert).await.map_err(|_| AlertSinkError::Closed)
    }
}

/// Sink that writes alerts to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn deliver(&self, alert: RiskAlert) -> Result<(), AlertSinkError> {
        match alert.kind {
            AlertKind::Liquidatable => error!(
                owner = %alert.owner,
                protocol = %alert.protocol,
                market = %alert.market_id,
                hf = alert.health_factor,
                "LIQUIDATABLE position"
            ),
            AlertKind::Escalation => warn!(
                owner = %alert.owner,
                protocol = %alert.protocol,
                market = %alert.market_id,
                from = %alert.previous_tier,
                to = %alert.new_tier,
                hf = alert.health_factor,
                "Risk escalated"
            ),
            AlertKind::Recovery => info!(
                owner = %alert.owner,
                protocol = %alert.protocol,
                market = %alert.market_id,
                from = %alert.previous_tier,
                to = %alert.new_tier,
                hf = alert.health_factor,
                "Risk recovered"
            ),
        }
        Ok(())
    }
}

/// Summary of one tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub owners_committed: usize,
    pub owners_failed: usize,
    pub alerts: Vec<RiskAlert>,
}

/// Consecutive failures of one owner's refresh.
#[derive(Debug, Clone, Copy, Default)]
struct OwnerHealth {
    consecutive_failures: u32,
    degraded: bool,
}

/// Health factor of every position in `set`, or the first price problem.
fn evaluate_positions(
    set: &PositionSet,
    prices: &dyn PriceLookup,
) -> Result<Vec<(PositionKey, f64)>, PriceError> {
    let mut observations = Vec::with_capacity(set.len());

    for (_, members) in set.domains() {
        let domain_hf = if members.iter().any(|p| p.has_debt()) {
            MarginAccount::evaluate(members.iter().copied(), prices)?.health_factor()
        } else {
            f64::INFINITY
        };

        for position in members {
            let hf = if position.has_debt() { domain_hf } else { f64::INFINITY };
            observations.push((position.key(), hf));
        }
    }

    Ok(observations)
}

/// Fetch, normalize and evaluate one owner.
async fn refresh_owner(
    adapters: &AdapterSet,
    prices: &dyn PriceLookup,
    owner: Address,
    cancel: &CancelSignal,
) -> EngineResult<Vec<(PositionKey, f64)>> {
    let sweep = adapters.refresh_positions(owner, cancel).await?;
    if !sweep.is_complete() {
        return Err(EngineError::DataUnavailable(sweep.problems().join("; ")));
    }

    let set = normalize(sweep.into_items())?;
    Ok(evaluate_positions(&set, prices)?)
}

/// Polls tracked owners and raises tier-transition alerts.
pub struct LiquidationMonitor {
    adapters: AdapterSet,
    prices: Arc<dyn PriceLookup>,
    sink: Arc<dyn AlertSink>,
    config: MonitorConfig,
    tracker: TierTracker,
    owners: BTreeSet<Address>,
    owner_health: HashMap<Address, OwnerHealth>,
}

impl LiquidationMonitor {
    pub fn new(
        adapters: AdapterSet,
        prices: Arc<dyn PriceLookup>,
        sink: Arc<dyn AlertSink>,
        config: MonitorConfig,
    ) -> Self {
        let tracker = TierTracker::new(HashMap::new(), config.recovery_hysteresis);
        Self {
            adapters,
            prices,
            sink,
            config,
            tracker,
            owners: BTreeSet::new(),
            owner_health: HashMap::new(),
        }
    }

    /// Replace the tier tracker, e.g. with one restored from a previous run.
    pub fn with_tracker(mut self, tracker: TierTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn tracker(&self) -> &TierTracker {
        &self.tracker
    }

    /// Start polling an owner. Returns false if already tracked.
    pub fn track(&mut self, owner: Address) -> bool {
        let added = self.owners.insert(owner);
        if added {
            info!(owner = %owner, "Tracking owner");
        }
        added
    }

    /// Stop polling an owner and forget its tiers.
    pub fn untrack(&mut self, owner: Address) -> bool {
        let removed = self.owners.remove(&owner);
        if removed {
            self.tracker.forget_owner(owner);
            self.owner_health.remove(&owner);
            info!(owner = %owner, "Stopped tracking owner");
        }
        removed
    }

    /// Owners currently polled.
    pub fn owners(&self) -> impl Iterator<Item = &Address> {
        self.owners.iter()
    }

    /// Consecutive failed polls of an owner.
    pub fn failure_count(&self, owner: &Address) -> u32 {
        self.owner_health
            .get(owner)
            .map(|h| h.consecutive_failures)
            .unwrap_or(0)
    }

    /// Whether an owner has failed `degraded_after_failures` polls in a row.
    pub fn is_degraded(&self, owner: &Address) -> bool {
        self.owner_health.get(owner).is_some_and(|h| h.degraded)
    }

    /// Run one poll of every tracked owner.
    #[instrument(skip(self, cancel), fields(owners = self.owners.len()))]
    pub async fn tick(&mut self, cancel: &CancelSignal) -> EngineResult<TickReport> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let started = Instant::now();
        let adapters = &self.adapters;
        let prices = self.prices.as_ref();

        let refreshes = self.owners.iter().copied().map(|owner| async move {
            (owner, refresh_owner(adapters, prices, owner, cancel).await)
        });
        let collected = stream::iter(refreshes)
            .buffer_unordered(self.config.owner_concurrency.max(1))
            .collect::<Vec<_>>();

        let mut results = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Tick cancelled, discarding refreshed positions");
                return Err(EngineError::Cancelled);
            }
            results = collected => results,
        };

        if cancel.is_cancelled()
            || results
                .iter()
                .any(|(_, outcome)| matches!(outcome, Err(EngineError::Cancelled)))
        {
            return Err(EngineError::Cancelled);
        }

        results.sort_by_key(|(owner, _)| *owner);

        let now = Utc::now();
        let mut report = TickReport::default();

        for (owner, outcome) in results {
            match outcome {
                Ok(observations) => {
                    self.mark_success(owner);

                    let live: HashSet<PositionKey> =
                        observations.iter().map(|(key, _)| key.clone()).collect();
                    self.tracker.retain_owner(owner, &live);

                    for (key, hf) in &observations {
                        let Some(alert) = self.tracker.observe(key, *hf, now) else {
                            continue;
                        };

                        let delivered = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => None,
                            result = self.sink.deliver(alert.clone()) => Some(result),
                        };
                        match delivered {
                            Some(Ok(())) => report.alerts.push(alert),
                            Some(Err(e)) => {
                                warn!(position = %key, error = %e, "Alert delivery failed, will retry");
                                self.tracker.revert(&alert);
                            }
                            None => {
                                // Owners already processed keep their tiers
                                debug!(position = %key, "Tick cancelled during alert delivery");
                                self.tracker.revert(&alert);
                                return Err(EngineError::Cancelled);
                            }
                        }
                    }
                    report.owners_committed += 1;
                }
                Err(e) => {
                    self.mark_failure(owner, &e);
                    report.owners_failed += 1;
                }
            }
        }

        debug!(
            committed = report.owners_committed,
            failed = report.owners_failed,
            alerts = report.alerts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Monitor tick finished"
        );

        Ok(report)
    }

    fn mark_success(&mut self, owner: Address) {
        let health = self.owner_health.entry(owner).or_default();
        if health.degraded {
            info!(
                owner = %owner,
                failed_polls = health.consecutive_failures,
                "Owner data recovered"
            );
        }
        *health = OwnerHealth::default();
    }

    fn mark_failure(&mut self, owner: Address, reason: &EngineError) {
        let threshold = self.config.degraded_after_failures.max(1);
        let health = self.owner_health.entry(owner).or_default();
        health.consecutive_failures += 1;

        if let EngineError::ConsistencyViolation(_) = reason {
            error!(owner = %owner, error = %reason, "Inconsistent position data");
        } else {
            debug!(
                owner = %owner,
                failures = health.consecutive_failures,
                error = %reason,
                "Owner refresh incomplete, keeping previous tiers"
            );
        }

        if !health.degraded && health.consecutive_failures >= threshold {
            health.degraded = true;
            warn!(
                owner = %owner,
                failures = health.consecutive_failures,
                error = %reason,
                "Owner data degraded"
            );
        }
    }

    /// Poll on the configured interval until `cancel` fires.
    pub async fn run(mut self, cancel: CancelSignal) {
        info!(
            owners = self.owners.len(),
            interval_secs = self.config.poll_interval_secs,
            "Starting liquidation monitor"
        );

        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.tick(&cancel).await {
                Ok(report) if !report.alerts.is_empty() => info!(
                    alerts = report.alerts.len(),
                    failed = report.owners_failed,
                    "Monitor tick raised alerts"
                ),
                Ok(_) => {}
                Err(EngineError::Cancelled) => break,
                Err(e) => warn!(error = %e, "Monitor tick failed"),
            }
        }

        info!("Liquidation monitor stopped");
    }
}
