use crate::command::{Command, Request};
use crate::{Ballot, Key, Slot, ID};
use serde::{Deserialize, Serialize};

/// `PREPARE` is the phase 1a message broadcast by a replica proposing to
/// lead a key at `ballot`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Prepare {
    pub key: Key,
    pub ballot: Ballot,
}

/// `PROMISE` is the phase 1b reply. `ballot` is the sender's own ballot
/// after observing the prepare, which may exceed the prepared one; it only
/// counts towards the quorum when the two match. `pre_slot` carries the
/// sender's slot watermark for log-tail discovery.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Promise {
    pub key: Key,
    pub from: ID,
    pub ballot: Ballot,
    pub pre_slot: Slot,
}

/// `ACCEPT` is the phase 2a message multicast within the leader's site,
/// proposing `commands` for one slot of the key's log.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Accept {
    pub key: Key,
    pub ballot: Ballot,
    pub slot: Slot,
    pub commands: Vec<Command>,
}

/// `ACCEPTED` is the phase 2b reply. As with promises, `ballot` is the
/// sender's own ballot and counts only when it matches the proposal.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Accepted {
    pub key: Key,
    pub from: ID,
    pub ballot: Ballot,
    pub slot: Slot,
}

/// `COMMIT` is broadcast once a slot reaches its phase 2 quorum, carrying
/// the decided commands so every replica can learn them.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Commit {
    pub key: Key,
    pub ballot: Ballot,
    pub slot: Slot,
    pub commands: Vec<Command>,
}

/// Hint from the current leader of a key to a foreign-site replica that it
/// should run phase 1 and take the key over.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct LeaderChange {
    pub key: Key,
    pub from: ID,
    pub to: ID,
    pub ballot: Ballot,
}

/// Wire messages exchanged between replicas.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Message {
    Prepare(Prepare),
    Promise(Promise),
    Accept(Accept),
    Accepted(Accepted),
    Commit(Commit),
    LeaderChange(LeaderChange),
}

impl Message {
    /// Key the message concerns.
    pub fn key(&self) -> Key {
        match self {
            Message::Prepare(m) => m.key,
            Message::Promise(m) => m.key,
            Message::Accept(m) => m.key,
            Message::Accepted(m) => m.key,
            Message::Commit(m) => m.key,
            Message::LeaderChange(m) => m.key,
        }
    }
}

impl From<Prepare> for Message {
    fn from(m: Prepare) -> Message {
        Message::Prepare(m)
    }
}

impl From<Promise> for Message {
    fn from(m: Promise) -> Message {
        Message::Promise(m)
    }
}

impl From<Accept> for Message {
    fn from(m: Accept) -> Message {
        Message::Accept(m)
    }
}

impl From<Accepted> for Message {
    fn from(m: Accepted) -> Message {
        Message::Accepted(m)
    }
}

impl From<Commit> for Message {
    fn from(m: Commit) -> Message {
        Message::Commit(m)
    }
}

impl From<LeaderChange> for Message {
    fn from(m: LeaderChange) -> Message {
        Message::LeaderChange(m)
    }
}

/// Inbound events consumed by a replica's single message loop.
#[derive(Debug)]
pub enum Event {
    /// A client request entering, or re-entering, the replica.
    Request(Request),
    /// A protocol message from a peer, or looped back from this replica.
    Message(Message),
    /// Synthetic timer event: run the backed-off prepare retry for a key.
    RetryPrepare(Key),
}
