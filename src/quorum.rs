use crate::config::{Config, QuorumKind};
use crate::id::{Zone, ID};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Membership snapshot the quorum trackers evaluate against: replica count,
/// zone sizes and the configured quorum system. Derived from the
/// configuration once and shared by every tracker a replica mints.
#[derive(Clone, Debug)]
pub struct QuorumSpec {
    kind: QuorumKind,
    f: usize,
    n: usize,
    zones: HashMap<Zone, usize>,
}

impl QuorumSpec {
    /// Builds the snapshot from the loaded configuration.
    pub fn from_config(config: &Config) -> QuorumSpec {
        let mut zones: HashMap<Zone, usize> = HashMap::new();
        for id in config.ids() {
            *zones.entry(id.zone()).or_insert(0) += 1;
        }
        QuorumSpec { kind: config.quorum, f: config.f, n: config.n(), zones }
    }

    /// Number of replicas in the membership.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Number of replicas in one zone.
    pub(crate) fn zone_size(&self, zone: Zone) -> usize {
        self.zones.get(&zone).copied().unwrap_or(0)
    }

    /// Zones in which the given ack counts form a zone-local majority.
    fn zone_majorities(&self, per_zone: &HashMap<Zone, usize>) -> usize {
        per_zone
            .iter()
            .filter(|&(zone, acks)| match self.zones.get(zone) {
                Some(size) => *acks * 2 > *size,
                None => false,
            })
            .count()
    }
}

/// Counts acknowledgements from distinct replicas and answers whether a
/// phase 1 or phase 2 quorum has been reached. Owned by a single per-key
/// instance; duplicate acks do not double-count.
///
/// Under the grid system, phase 1 needs zone-local majorities in at least
/// `zones − F` zones (a column across the grid) and phase 2 in at least
/// `F + 1` zones (rows), so any Q1 and Q2 share a zone and, within it, a
/// replica.
#[derive(Clone, Debug)]
pub struct Quorum {
    spec: Arc<QuorumSpec>,
    acks: HashSet<ID>,
    per_zone: HashMap<Zone, usize>,
}

impl Quorum {
    /// Creates an empty tracker over the membership snapshot.
    pub fn new(spec: Arc<QuorumSpec>) -> Quorum {
        Quorum { spec, acks: HashSet::new(), per_zone: HashMap::new() }
    }

    /// Records an acknowledgement from `id`. Idempotent per id.
    pub fn ack(&mut self, id: ID) {
        if self.acks.insert(id) {
            *self.per_zone.entry(id.zone()).or_insert(0) += 1;
        }
    }

    /// Number of distinct replicas acknowledged so far.
    pub fn len(&self) -> usize {
        self.acks.len()
    }

    /// Whether no acknowledgement has been recorded.
    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }

    /// Whether the phase 1 quorum has been reached.
    pub fn q1(&self) -> bool {
        match self.spec.kind {
            QuorumKind::Majority => self.majority(),
            QuorumKind::Grid => {
                let zones = self.spec.zones.len();
                let needed = zones.saturating_sub(self.spec.f).max(1);
                self.spec.zone_majorities(&self.per_zone) >= needed
            }
        }
    }

    /// Whether the phase 2 quorum has been reached.
    pub fn q2(&self) -> bool {
        match self.spec.kind {
            QuorumKind::Majority => self.majority(),
            QuorumKind::Grid => {
                let zones = self.spec.zones.len();
                let needed = (self.spec.f + 1).min(zones.max(1));
                self.spec.zone_majorities(&self.per_zone) >= needed
            }
        }
    }

    /// Forgets every acknowledgement, keeping the membership snapshot.
    pub fn reset(&mut self) {
        self.acks.clear();
        self.per_zone.clear();
    }

    fn majority(&self) -> bool {
        self.acks.len() * 2 > self.spec.n
    }
}
