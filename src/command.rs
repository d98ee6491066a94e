use crate::id::Zone;
use crate::messages::Message;
use crate::{Key, Slot, ID};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;

/// A single client operation against one key of the replicated store.
/// An absent value reads the key; a present value writes it.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Command {
    /// Key the operation targets.
    pub key: Key,
    /// Value to write, or `None` for a read.
    pub value: Option<Bytes>,
    /// Identifier of the issuing client; its zone drives locality tracking.
    pub client_id: ID,
    /// Client-assigned sequence number, used by clients to deduplicate
    /// their own retries.
    pub command_id: u64,
}

impl Command {
    /// Whether the command is a read.
    pub fn is_read(&self) -> bool {
        self.value.is_none()
    }
}

/// Reply delivered exactly once for every request a replica accepts. An
/// `ok == false` reply redirects the client to `leader_id`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    pub command_id: u64,
    pub client_id: ID,
    pub leader_id: ID,
    pub command: Command,
    pub timestamp: i64,
}

/// Capability to deliver exactly one [`Reply`] back to the originating
/// client path. The send never blocks; if the client has gone away the
/// reply is dropped.
pub struct ReplySink(oneshot::Sender<Reply>);

impl ReplySink {
    /// Creates a sink together with the receiving half the client awaits.
    pub fn channel() -> (ReplySink, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (ReplySink(tx), rx)
    }

    fn deliver(self, reply: Reply) {
        let _ = self.0.send(reply);
    }
}

/// A client request: the command plus the one-shot path back to the client.
///
/// Requests are deliberately not `Clone`. Whoever holds the request owns
/// the only reply path, so a request is always either answered, buffered,
/// or reposted to the replica's inbound channel, never duplicated.
pub struct Request {
    pub command: Command,
    pub timestamp: i64,
    sink: ReplySink,
}

impl Request {
    /// Creates a request and the receiver its single reply arrives on.
    pub fn new(command: Command, timestamp: i64) -> (Request, oneshot::Receiver<Reply>) {
        let (sink, rx) = ReplySink::channel();
        (Request { command, timestamp, sink }, rx)
    }

    /// Creates a request around an existing sink.
    pub fn with_sink(command: Command, timestamp: i64, sink: ReplySink) -> Request {
        Request { command, timestamp, sink }
    }

    /// Answers the request with an arbitrary reply, consuming it.
    pub fn reply(self, reply: Reply) {
        self.sink.deliver(reply);
    }

    /// Answers that the command was committed under `leader_id`.
    pub fn granted(self, leader_id: ID) {
        let Request { command, timestamp, sink } = self;
        sink.deliver(Reply {
            ok: true,
            command_id: command.command_id,
            client_id: command.client_id,
            leader_id,
            command,
            timestamp,
        });
    }

    /// Answers that this replica does not lead the key, pointing the client
    /// at the replica that does.
    pub fn redirect(self, leader_id: ID) {
        let Request { command, timestamp, sink } = self;
        sink.deliver(Reply {
            ok: false,
            command_id: command.command_id,
            client_id: command.client_id,
            leader_id,
            command,
            timestamp,
        });
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("command", &self.command)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Replica capabilities handed to each per-key Paxos instance: wire sends
/// plus the replica-local reinjection, timer and execution channels.
///
/// `broadcast` and `multicast` address every *other* replica; instances
/// acknowledge themselves explicitly, so their own messages never loop
/// back through the wire.
pub trait Transport {
    /// Consumer of committed slots.
    type Executor: Executor;

    /// Sends a message to a single replica. Sending to the local replica
    /// delivers through the inbound channel.
    fn send(&mut self, to: ID, msg: Message);

    /// Sends a message to every other replica.
    fn broadcast(&mut self, msg: Message);

    /// Sends a message to every other replica in `zone`.
    fn multicast(&mut self, zone: Zone, msg: Message);

    /// Requeues a request onto the replica's inbound channel after its
    /// slot was lost to a higher ballot.
    fn repost(&mut self, req: Request);

    /// Arranges for a retry-prepare event for `key` to enter the inbound
    /// channel after `delay`.
    fn schedule_retry(&mut self, key: Key, delay: Duration);

    /// The executor fed by commit-order slot decisions.
    fn executor(&mut self) -> &mut Self::Executor;
}

/// Applies committed commands to an external store. For any one key,
/// `execute` is called once per slot, in commit order.
pub trait Executor {
    fn execute(&mut self, key: Key, slot: Slot, commands: &[Command]);
}
