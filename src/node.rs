use crate::command::{Executor, Reply, Request, Transport};
use crate::config::Config;
use crate::id::{Zone, ID};
use crate::messages::{Event, Message};
use crate::replica::Replica;
use crate::{Command, Key};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::sleep;

/// Unicast seam to the transport substrate (TCP, UDP, in-memory channels).
/// Delivery is best effort and at most once; loss and reordering are
/// recovered by the protocol itself.
pub trait Wire {
    fn send(&mut self, to: ID, msg: Message);
}

/// Error surfaced to a client-path caller awaiting its reply.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("replica shut down before replying")]
    Canceled,
}

/// [`Transport`] implementation binding a replica's instances to the
/// node's channels: wire sends go out through the [`Wire`], local sends,
/// reposts and retry timers come back through the inbound channel, and
/// committed slots land in the executor.
pub struct NodeTransport<W, E> {
    id: ID,
    config: Arc<Config>,
    wire: W,
    inbound: UnboundedSender<Event>,
    executor: E,
}

impl<W: Wire, E: Executor> Transport for NodeTransport<W, E> {
    type Executor = E;

    fn send(&mut self, to: ID, msg: Message) {
        if to == self.id {
            // local delivery still goes through the serializer
            let _ = self.inbound.send(Event::Message(msg));
        } else {
            self.wire.send(to, msg);
        }
    }

    fn broadcast(&mut self, msg: Message) {
        for id in self.config.ids() {
            if id != self.id {
                self.wire.send(id, msg.clone());
            }
        }
    }

    fn multicast(&mut self, zone: Zone, msg: Message) {
        for id in self.config.ids() {
            if id != self.id && id.zone() == zone {
                self.wire.send(id, msg.clone());
            }
        }
    }

    fn repost(&mut self, req: Request) {
        let _ = self.inbound.send(Event::Request(req));
    }

    fn schedule_retry(&mut self, key: Key, delay: Duration) {
        let inbound = self.inbound.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = inbound.send(Event::RetryPrepare(key));
        });
    }

    fn executor(&mut self) -> &mut E {
        &mut self.executor
    }
}

/// Binds a [`Replica`] to its inbound channel.
///
/// The node's [`run`](Node::run) loop is the single logical serializer:
/// every per-key handler executes on it, so within a key message handling
/// is totally ordered and non-reentrant.
pub struct Node<W: Wire, E: Executor> {
    replica: Replica<NodeTransport<W, E>>,
    inbound: UnboundedReceiver<Event>,
}

/// Cloneable handle feeding a node: peers deliver wire messages through
/// it and clients submit commands.
#[derive(Clone)]
pub struct NodeHandle {
    id: ID,
    inbound: UnboundedSender<Event>,
}

impl<W: Wire, E: Executor> Node<W, E> {
    /// Creates a node around the configuration fetched at startup.
    pub fn new(id: ID, config: Arc<Config>, wire: W, executor: E) -> (Node<W, E>, NodeHandle) {
        info!(
            "{} starting: algorithm={} quorum={:?} f={} adaptive={} policy={:?} threshold={} \
             backoff={}ms thrifty={} chan_buffer={}",
            id,
            config.algorithm,
            config.quorum,
            config.f,
            config.adaptive,
            config.policy,
            config.threshold,
            config.backoff,
            config.thrifty,
            config.chan_buffer_size,
        );
        if !config.reply_when_commit {
            warn!(
                "{} replies on commit; reply_when_commit=false is left to an \
                 execution-aware server",
                id
            );
        }

        let (tx, rx) = unbounded_channel();
        let transport = NodeTransport {
            id,
            config: config.clone(),
            wire,
            inbound: tx.clone(),
            executor,
        };
        let node = Node { replica: Replica::new(id, config, transport), inbound: rx };
        (node, NodeHandle { id, inbound: tx })
    }

    /// The routed replica, for introspection.
    pub fn replica(&self) -> &Replica<NodeTransport<W, E>> {
        &self.replica
    }

    /// The executor holding this node's applied state.
    pub fn executor(&mut self) -> &mut E {
        self.replica.transport_mut().executor()
    }

    /// Consumes inbound events until every handle is gone.
    pub async fn run(mut self) {
        while let Some(event) = self.inbound.recv().await {
            self.replica.on_event(event);
        }
        info!("{} message loop stopped", self.replica.id());
    }
}

impl NodeHandle {
    /// Identifier of the node behind this handle.
    pub fn id(&self) -> ID {
        self.id
    }

    /// Delivers a wire message from the transport substrate.
    pub fn deliver(&self, msg: Message) {
        let _ = self.inbound.send(Event::Message(msg));
    }

    /// Submits a client command and awaits its single reply. An
    /// `ok == false` reply redirects to the current leader; retrying is
    /// the client's business.
    pub async fn request(&self, command: Command) -> Result<Reply, RequestError> {
        let (req, rx) = Request::new(command, unix_millis());
        let _ = self.inbound.send(Event::Request(req));
        rx.await.map_err(|_| RequestError::Canceled)
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::timeout;

    /// In-memory wire routing messages into each node's inbound channel.
    #[derive(Clone, Default)]
    struct ChannelWire {
        routes: Arc<Mutex<HashMap<ID, UnboundedSender<Event>>>>,
    }

    impl Wire for ChannelWire {
        fn send(&mut self, to: ID, msg: Message) {
            if let Some(tx) = self.routes.lock().unwrap().get(&to) {
                let _ = tx.send(Event::Message(msg));
            }
        }
    }

    fn config() -> Arc<Config> {
        let mut config = Config::default();
        for id in ["1.1", "1.2", "2.1"].iter() {
            config.addrs.insert(id.parse().unwrap(), String::new());
        }
        Arc::new(config)
    }

    fn id(s: &str) -> ID {
        s.parse().unwrap()
    }

    async fn cluster() -> Vec<NodeHandle> {
        let config = config();
        let wire = ChannelWire::default();
        let mut handles = Vec::new();
        for node_id in config.ids().collect::<Vec<_>>() {
            let (node, handle) =
                Node::new(node_id, config.clone(), wire.clone(), MemStore::default());
            wire.routes
                .lock()
                .unwrap()
                .insert(node_id, handle.clone().inbound);
            handles.push(handle);
            tokio::spawn(node.run());
        }
        handles.sort_by_key(|h| h.id());
        handles
    }

    #[tokio::test]
    async fn cluster_commits_over_channels() {
        let handles = cluster().await;
        let leader = &handles[0];
        assert_eq!(id("1.1"), leader.id());

        let put = Command {
            key: 7,
            value: Some(Bytes::from_static(b"hello")),
            client_id: id("1.9"),
            command_id: 1,
        };
        let reply = timeout(Duration::from_secs(5), leader.request(put))
            .await
            .expect("commit within deadline")
            .unwrap();
        assert!(reply.ok);
        assert_eq!(id("1.1"), reply.leader_id);
        assert_eq!(1, reply.command_id);

        let again = Command {
            key: 7,
            value: Some(Bytes::from_static(b"world")),
            client_id: id("1.9"),
            command_id: 2,
        };
        let reply = timeout(Duration::from_secs(5), leader.request(again))
            .await
            .expect("commit within deadline")
            .unwrap();
        assert!(reply.ok);
        assert_eq!(2, reply.command_id);
    }

    #[tokio::test]
    async fn requests_error_once_the_node_is_gone() {
        let config = config();
        let (node, handle) =
            Node::new(id("1.1"), config, ChannelWire::default(), MemStore::default());
        drop(node);

        let get = Command { key: 1, value: None, client_id: id("1.9"), command_id: 1 };
        assert!(matches!(handle.request(get).await, Err(RequestError::Canceled)));
    }
}
