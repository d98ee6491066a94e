use crate::command::Transport;
use crate::config::Config;
use crate::messages::{Event, Message};
use crate::paxos::Paxos;
use crate::quorum::QuorumSpec;
use crate::{Key, ID};
use std::collections::HashMap;
use std::sync::Arc;

/// Routes inbound events to per-key Paxos instances.
///
/// The replica owns the key-to-instance map and is the only thing that
/// mutates it. Instances are created lazily on the first message that
/// implies the key exists here (a request, prepare, accept, commit or
/// leader change); promises and accepted messages only make sense for a
/// key this replica already tracks, so for unknown keys they are dropped.
pub struct Replica<T: Transport> {
    id: ID,
    config: Arc<Config>,
    spec: Arc<QuorumSpec>,
    transport: T,
    instances: HashMap<Key, Paxos>,
}

impl<T: Transport> Replica<T> {
    pub fn new(id: ID, config: Arc<Config>, transport: T) -> Replica<T> {
        let spec = Arc::new(QuorumSpec::from_config(&config));
        let instances = HashMap::with_capacity(config.buffer_size);
        Replica { id, config, spec, transport, instances }
    }

    /// Identifier of this replica.
    pub fn id(&self) -> ID {
        self.id
    }

    /// The capability instances emit their messages through.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Per-key state, if the key has been seen here.
    pub fn paxos(&self, key: Key) -> Option<&Paxos> {
        self.instances.get(&key)
    }

    /// Number of keys this replica currently leads.
    pub fn active_keys(&self) -> usize {
        self.instances.values().filter(|p| p.active()).count()
    }

    /// Handles one inbound event. Within a key, calls are totally ordered
    /// by the caller's single message loop.
    pub fn on_event(&mut self, event: Event) {
        match event {
            Event::Request(req) => {
                trace!("{} received {:?}", self.id, req);
                let key = req.command.key;
                init(&mut self.instances, key, self.id, &self.config, &self.spec)
                    .on_request(req, &mut self.transport);
            }
            Event::Message(msg) => self.on_message(msg),
            Event::RetryPrepare(key) => match self.instances.get_mut(&key) {
                Some(paxos) => paxos.on_retry(&mut self.transport),
                None => debug!("{} has no key {} for a retry", self.id, key),
            },
        }
    }

    fn on_message(&mut self, msg: Message) {
        trace!("{} <<< {:?}", self.id, msg);
        match msg {
            Message::Prepare(m) => {
                init(&mut self.instances, m.key, self.id, &self.config, &self.spec)
                    .on_prepare(m, &mut self.transport);
            }
            Message::Promise(m) => {
                match self.instances.get_mut(&m.key) {
                    Some(paxos) => paxos.on_promise(m, &mut self.transport),
                    None => {
                        debug!("{} dropping {:?} for unknown key", self.id, m);
                        return;
                    }
                }
                trace!("{} leads {} keys", self.id, self.active_keys());
            }
            Message::Accept(m) => {
                init(&mut self.instances, m.key, self.id, &self.config, &self.spec)
                    .on_accept(m, &mut self.transport);
            }
            Message::Accepted(m) => match self.instances.get_mut(&m.key) {
                Some(paxos) => paxos.on_accepted(m, &mut self.transport),
                None => debug!("{} dropping {:?} for unknown key", self.id, m),
            },
            Message::Commit(m) => {
                init(&mut self.instances, m.key, self.id, &self.config, &self.spec)
                    .on_commit(m, &mut self.transport);
            }
            Message::LeaderChange(m) => {
                init(&mut self.instances, m.key, self.id, &self.config, &self.spec)
                    .on_leader_change(m, &mut self.transport);
            }
        }
    }
}

fn init<'a>(
    instances: &'a mut HashMap<Key, Paxos>,
    key: Key,
    id: ID,
    config: &Arc<Config>,
    spec: &Arc<QuorumSpec>,
) -> &'a mut Paxos {
    instances.entry(key)
        .or_insert_with(|| Paxos::new(key, id, config.clone(), spec.clone()))
}
