//! Position normalizer: merges adapter output into one canonical set.

use alloy::primitives::Address;
use lendscope_chain::{Position, PositionKey, Protocol};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Positions sharing a margin domain. Most domains hold a handful.
pub type DomainMembers<'a> = SmallVec<[&'a Position; 8]>;

/// Identifies one owner's margin account inside a protocol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainKey {
    pub owner: Address,
    pub domain: String,
}

/// Immutable, ordered set of positions produced by one poll.
///
/// Every poll builds a replacement set; nothing mutates one in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionSet {
    positions: BTreeMap<PositionKey, Position>,
}

impl PositionSet {
    /// An empty set.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn get(&self, key: &PositionKey) -> Option<&Position> {
        self.positions.get(key)
    }

    pub fn contains(&self, key: &PositionKey) -> bool {
        self.positions.contains_key(key)
    }

    /// Positions in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &PositionKey> {
        self.positions.keys()
    }

    /// Positions of one owner.
    pub fn for_owner(&self, owner: Address) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(move |p| p.owner == owner)
    }

    /// Positions of one protocol.
    pub fn for_protocol(&self, protocol: Protocol) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(move |p| p.protocol == protocol)
    }

    /// Subset holding one protocol's positions.
    pub fn only_protocol(&self, protocol: Protocol) -> PositionSet {
        let positions = self
            .positions
            .iter()
            .filter(|(key, _)| key.protocol == protocol)
            .map(|(key, position)| (key.clone(), position.clone()))
            .collect();
        PositionSet { positions }
    }

    /// Protocols present in the set, in order.
    pub fn protocols(&self) -> BTreeSet<Protocol> {
        self.positions.keys().map(|k| k.protocol).collect()
    }

    /// Members of the margin domain `position` belongs to.
    pub fn domain_of(&self, position: &Position) -> DomainMembers<'_> {
        self.positions
            .values()
            .filter(|p| p.owner == position.owner && p.margin_domain == position.margin_domain)
            .collect()
    }

    /// Group positions by (owner, margin domain), in deterministic order.
    pub fn domains(&self) -> BTreeMap<DomainKey, DomainMembers<'_>> {
        let mut domains: BTreeMap<DomainKey, DomainMembers<'_>> = BTreeMap::new();
        for position in self.positions.values() {
            domains
                .entry(DomainKey {
                    owner: position.owner,
                    domain: position.margin_domain.clone(),
                })
                .or_default()
                .push(position);
        }
        domains
    }
}

impl<'a> IntoIterator for &'a PositionSet {
    type Item = &'a Position;
    type IntoIter = std::collections::btree_map::Values<'a, PositionKey, Position>;

    fn into_iter(self) -> Self::IntoIter {
        self.positions.values()
    }
}

/// Build a canonical position set.
///
/// Zero-balance positions are dropped (a position with nothing supplied
/// and nothing borrowed does not exist). A repeated key or a liquidation
/// threshold outside [0, 1] means an adapter broke its contract and is
/// reported as a consistency violation.
pub fn normalize(positions: impl IntoIterator<Item = Position>) -> EngineResult<PositionSet> {
    let mut set = BTreeMap::new();
    let mut dropped = 0usize;

    for position in positions {
        if position.is_empty() {
            dropped += 1;
            continue;
        }

        let lt = position.liquidation_threshold;
        if !lt.is_finite() || !(0.0..=1.0).contains(&lt) {
            return Err(EngineError::ConsistencyViolation(format!(
                "position {} has liquidation threshold {lt}",
                position.key()
            )));
        }

        let key = position.key();
        if set.contains_key(&key) {
            return Err(EngineError::ConsistencyViolation(format!(
                "duplicate position {key}"
            )));
        }
        set.insert(key, position);
    }

    debug!(positions = set.len(), dropped_empty = dropped, "Normalized positions");
    Ok(PositionSet { positions: set })
}
