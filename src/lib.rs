//! Per-key multi-leader Multi-Paxos replication.
//!
//! Every key of a replicated key-value store runs an independent instance of
//! the Multi-Paxos algorithm, and leadership for a key migrates between
//! geographic sites based on access locality: a leader that keeps seeing
//! traffic from a foreign site hands the key over to that site.
//!
//! The crate provides the protocol core only. A [`Replica`] routes inbound
//! [`Event`]s to per-key [`Paxos`] state machines, which emit messages
//! through the [`Transport`] capability handed to them by the replica.
//! [`Node`] binds a replica to tokio channels so that all per-key handling
//! runs under one inbound message loop. The transport substrate itself
//! (TCP, UDP, in-memory channels) stays behind the [`Wire`] seam.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use wpaxos::{Config, MemStore, Node};
//! # use std::sync::Arc;
//! # fn wire() -> impl wpaxos::Wire { struct Nop; impl wpaxos::Wire for Nop {
//! #     fn send(&mut self, _: wpaxos::ID, _: wpaxos::Message) {} } Nop }
//! # async fn run() -> Result<(), wpaxos::ConfigError> {
//! let config = Arc::new(Config::load("config.json")?);
//! let id = "1.1".parse().unwrap();
//! let (node, handle) = Node::new(id, config, wire(), MemStore::default());
//! tokio::spawn(node.run());
//! # drop(handle);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

mod command;
mod config;
mod id;
mod messages;
mod node;
mod paxos;
mod quorum;
mod replica;
mod stat;
mod store;

pub use command::{Command, Executor, Reply, ReplySink, Request, Transport};
pub use config::{Config, ConfigError, Policy, QuorumKind};
pub use id::{ParseIdError, Zone, ID};
pub use messages::{Accept, Accepted, Commit, Event, LeaderChange, Message, Prepare, Promise};
pub use node::{Node, NodeHandle, NodeTransport, RequestError, Wire};
pub use paxos::Paxos;
pub use quorum::{Quorum, QuorumSpec};
pub use replica::Replica;
pub use stat::Stat;
pub use store::MemStore;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of the replicated store. Every key runs its own Multi-Paxos log.
pub type Key = u64;

/// Increasing sequence number of slots within a single key's log.
pub type Slot = u64;

/// Ballot numbering orders proposals across replicas. A ballot packs a
/// round number in its high bits and the proposing replica's [`ID`] in its
/// low bits, so ballots order by round first and are unique per proposer.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Ballot(u64);

impl Ballot {
    /// The zero ballot, held by a key before any replica prepared it.
    pub const ZERO: Ballot = Ballot(0);

    /// Creates a ballot for `round` proposed by `leader`.
    pub fn new(round: u32, leader: ID) -> Ballot {
        Ballot((u64::from(round) << 32) | u64::from(leader.pack()))
    }

    /// Round number in the high bits.
    pub fn round(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Replica embedded in the low bits, i.e. the proposer this ballot
    /// belongs to.
    pub fn leader(self) -> ID {
        ID::unpack(self.0 as u32)
    }

    /// Smallest ballot of the next round carrying `id` as its proposer.
    pub fn next(self, id: ID) -> Ballot {
        Ballot::new(self.round() + 1, id)
    }

    /// Whether this is the zero ballot.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.round(), self.leader())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ballot_ordering() {
        let b = Ballot::new(5, ID::new(1, 2));
        assert!(Ballot::new(2, ID::new(3, 3)) < b);
        assert!(Ballot::new(8, ID::new(1, 1)) > b);
        assert!(Ballot::new(5, ID::new(1, 1)) < b);
        assert!(Ballot::new(5, ID::new(2, 1)) > b);
        assert_eq!(Ballot::new(5, ID::new(1, 2)), b);
        assert!(Ballot::ZERO < b);
    }

    #[test]
    fn ballot_leader_round_trip() {
        let b = Ballot::new(7, ID::new(3, 9));
        assert_eq!(7, b.round());
        assert_eq!(ID::new(3, 9), b.leader());
    }

    #[test]
    fn ballot_next() {
        let id = ID::new(1, 1);
        let b = Ballot::ZERO.next(id);
        assert_eq!(Ballot::new(1, id), b);
        assert_eq!(id, b.leader());

        // the next ballot supersedes any other proposer's ballot of the
        // same round
        let other = Ballot::new(1, ID::new(2, 1));
        assert!(other.next(id) > other);
        assert_eq!(id, other.next(id).leader());
    }

    #[test]
    fn ballot_zero_has_no_leader() {
        assert!(Ballot::ZERO.is_zero());
        assert_eq!(ID::new(0, 0), Ballot::ZERO.leader());
        assert!(!Ballot::new(0, ID::new(1, 1)).is_zero());
    }
}
