use crate::config::Policy;
use crate::id::ID;
use std::collections::{HashMap, VecDeque};

/// Access-locality counter for one key.
///
/// The leader records a hit per request against the canonical node of the
/// issuing client's zone, collapsing all clients of a site into one
/// counter; the policy then nominates the dominant site once the
/// configured threshold is met. With a threshold of zero the counter is
/// inert and leadership never migrates.
#[derive(Debug)]
pub struct Stat {
    policy: Policy,
    threshold: usize,
    /// Current run of identical hits, for the consecutive policy.
    run: Option<(ID, usize)>,
    /// Sliding window of recent hits, for the majority policy.
    window: VecDeque<ID>,
}

impl Stat {
    pub fn new(policy: Policy, threshold: usize) -> Stat {
        Stat { policy, threshold, run: None, window: VecDeque::new() }
    }

    /// Records a hit from `id` and returns the site that should take
    /// leadership, or `None` while no handover is warranted. A nomination
    /// resets the counter so the signal does not re-fire on every
    /// subsequent request.
    pub fn hit(&mut self, id: ID) -> Option<ID> {
        if self.threshold == 0 {
            return None;
        }
        match self.policy {
            Policy::Consecutive => self.consecutive(id),
            Policy::Majority => self.window_majority(id),
        }
    }

    fn consecutive(&mut self, id: ID) -> Option<ID> {
        let count = match self.run {
            Some((last, count)) if last == id => count + 1,
            _ => 1,
        };
        if count >= self.threshold {
            self.run = None;
            Some(id)
        } else {
            self.run = Some((id, count));
            None
        }
    }

    fn window_majority(&mut self, id: ID) -> Option<ID> {
        self.window.push_back(id);
        if self.window.len() < self.threshold {
            return None;
        }

        let mut counts: HashMap<ID, usize> = HashMap::new();
        for hit in &self.window {
            *counts.entry(*hit).or_insert(0) += 1;
        }
        let (site, count) = counts
            .into_iter()
            .max_by_key(|&(site, count)| (count, site))
            .unwrap_or((id, 0));

        if count * 2 > self.window.len() {
            self.window.clear();
            Some(site)
        } else {
            self.window.pop_front();
            None
        }
    }
}
