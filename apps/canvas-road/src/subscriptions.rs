//! Per-connection subscription lists and the region → subscribers index.
//!
//! A connection's list is ordered oldest-first and bounded; once full, new
//! regions push the oldest ones out.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::connection::ConnectionId;
use crate::region::RegionKey;

/// Result of merging a subscribe request into an existing list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reconciled {
    /// Final list, oldest first.
    pub retained: Vec<RegionKey>,
    /// Regions pushed out to respect the cap, oldest first.
    pub evicted: Vec<RegionKey>,
}

/// Append `requested` to `existing`, keep the first occurrence of each region
/// and evict from the front until at most `cap` remain.
pub fn reconcile(existing: &[RegionKey], requested: &[RegionKey], cap: usize) -> Reconciled {
    let mut seen = HashSet::with_capacity(existing.len() + requested.len());
    let mut merged: Vec<RegionKey> = existing
        .iter()
        .chain(requested)
        .copied()
        .filter(|region| seen.insert(*region))
        .collect();

    let overflow = merged.len().saturating_sub(cap);
    let retained = merged.split_off(overflow);
    Reconciled {
        retained,
        evicted: merged,
    }
}

/// `existing` without any region in `remove`, order preserved.
pub fn unsubscribe(existing: &[RegionKey], remove: &[RegionKey]) -> Vec<RegionKey> {
    let remove: HashSet<&RegionKey> = remove.iter().collect();
    existing
        .iter()
        .filter(|region| !remove.contains(region))
        .copied()
        .collect()
}

/// Reverse index from a region to the connections subscribed to it. An entry
/// exists only while it has at least one subscriber.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    entries: HashMap<RegionKey, Vec<ConnectionId>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `connection` to `region`. Returns true when the entry was created.
    pub fn insert(&mut self, region: RegionKey, connection: ConnectionId) -> bool {
        let mut created = false;
        let subscribers = self.entries.entry(region).or_insert_with(|| {
            created = true;
            Vec::new()
        });
        if !subscribers.contains(&connection) {
            subscribers.push(connection);
        }
        created
    }

    /// Remove `connection` from `region`. Returns true when that left the
    /// region without subscribers and the entry was dropped.
    pub fn remove(&mut self, region: &RegionKey, connection: &ConnectionId) -> bool {
        let Some(subscribers) = self.entries.get_mut(region) else {
            return false;
        };
        subscribers.retain(|id| id != connection);
        if subscribers.is_empty() {
            self.entries.remove(region);
            return true;
        }
        false
    }

    pub fn subscribers(&self, region: &RegionKey) -> &[ConnectionId] {
        self.entries
            .get(region)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn contains(&self, region: &RegionKey) -> bool {
        self.entries.contains_key(region)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Order-insensitive view of the whole index.
    pub fn snapshot(&self) -> BTreeMap<RegionKey, BTreeSet<ConnectionId>> {
        self.entries
            .iter()
            .map(|(region, subscribers)| (*region, subscribers.iter().copied().collect()))
            .collect()
    }
}
