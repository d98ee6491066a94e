//! Deterministic in-memory cluster for protocol scenarios: a shared bus of
//! per-replica event queues with link-level drop injection, drained in a
//! fixed replica order so every run of a test sees the same interleaving.

use bytes::Bytes;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::mem;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use wpaxos::{
    Command, Config, Event, Key, MemStore, Message, Reply, Replica, Request, Transport, Zone, ID,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn id(s: &str) -> ID {
    s.parse().unwrap()
}

/// Configuration over the given replica ids, majority quorum, handover off.
pub fn config(ids: &[&str]) -> Config {
    let mut config = Config::default();
    for replica in ids {
        config.addrs.insert(id(replica), String::new());
    }
    config
}

pub fn put(key: Key, value: &'static str, client: &str, command_id: u64) -> Command {
    Command {
        key,
        value: Some(Bytes::from_static(value.as_bytes())),
        client_id: id(client),
        command_id,
    }
}

pub fn reply(rx: &mut oneshot::Receiver<Reply>) -> Reply {
    rx.try_recv().expect("reply delivered")
}

pub fn history_values(store: &MemStore, key: Key) -> Vec<Vec<u8>> {
    store.history(key).iter().map(|b| b.to_vec()).collect()
}

#[derive(Default)]
pub struct Bus {
    pub queues: HashMap<ID, VecDeque<Event>>,
    /// Severed links, as `(from, to)` pairs.
    pub cut: HashSet<(ID, ID)>,
    /// Retry prepares scheduled by instances, fired manually by the test.
    pub retries: Vec<(ID, Key, Duration)>,
}

impl Bus {
    fn push(&mut self, from: ID, to: ID, event: Event) {
        if self.cut.contains(&(from, to)) {
            return;
        }
        self.queues.entry(to).or_insert_with(VecDeque::new).push_back(event);
    }
}

/// [`Transport`] writing into the shared bus.
pub struct BusTransport {
    id: ID,
    config: Arc<Config>,
    bus: Rc<RefCell<Bus>>,
    pub store: MemStore,
}

impl Transport for BusTransport {
    type Executor = MemStore;

    fn send(&mut self, to: ID, msg: Message) {
        self.bus.borrow_mut().push(self.id, to, Event::Message(msg));
    }

    fn broadcast(&mut self, msg: Message) {
        for to in self.config.ids().collect::<Vec<_>>() {
            if to != self.id {
                self.send(to, msg.clone());
            }
        }
    }

    fn multicast(&mut self, zone: Zone, msg: Message) {
        for to in self.config.ids().collect::<Vec<_>>() {
            if to != self.id && to.zone() == zone {
                self.send(to, msg.clone());
            }
        }
    }

    fn repost(&mut self, req: Request) {
        let own = self.id;
        self.bus.borrow_mut().push(own, own, Event::Request(req));
    }

    fn schedule_retry(&mut self, key: Key, delay: Duration) {
        self.bus.borrow_mut().retries.push((self.id, key, delay));
    }

    fn executor(&mut self) -> &mut MemStore {
        &mut self.store
    }
}

pub struct Cluster {
    pub config: Arc<Config>,
    pub bus: Rc<RefCell<Bus>>,
    replicas: HashMap<ID, Replica<BusTransport>>,
    order: Vec<ID>,
}

impl Cluster {
    pub fn new(config: Config) -> Cluster {
        init_logging();
        let config = Arc::new(config);
        let bus = Rc::new(RefCell::new(Bus::default()));
        let mut order: Vec<ID> = config.ids().collect();
        order.sort_unstable();

        let mut replicas = HashMap::new();
        for replica in order.iter().copied() {
            replicas.insert(replica, Cluster::spawn(replica, &config, &bus));
        }
        Cluster { config, bus, replicas, order }
    }

    fn spawn(id: ID, config: &Arc<Config>, bus: &Rc<RefCell<Bus>>) -> Replica<BusTransport> {
        let transport = BusTransport {
            id,
            config: config.clone(),
            bus: bus.clone(),
            store: MemStore::default(),
        };
        Replica::new(id, config.clone(), transport)
    }

    pub fn ids(&self) -> Vec<ID> {
        self.order.clone()
    }

    pub fn replica(&self, id: ID) -> &Replica<BusTransport> {
        &self.replicas[&id]
    }

    pub fn store(&self, id: ID) -> &MemStore {
        &self.replica(id).transport().store
    }

    /// Injects a client request at one replica and returns the reply path.
    pub fn submit(&mut self, at: ID, command: Command) -> oneshot::Receiver<Reply> {
        let (req, rx) = Request::new(command, 0);
        self.replicas
            .get_mut(&at)
            .expect("known replica")
            .on_event(Event::Request(req));
        rx
    }

    /// Delivers queued events, replica by replica in id order, until the
    /// network is quiet. Scheduled retries stay parked until
    /// [`fire_retries`](Cluster::fire_retries).
    pub fn run(&mut self) {
        loop {
            let mut progressed = false;
            for replica in self.order.clone() {
                while self.step(replica) {
                    progressed = true;
                }
            }
            if !progressed {
                return;
            }
        }
    }

    fn step(&mut self, replica: ID) -> bool {
        let event = {
            let mut bus = self.bus.borrow_mut();
            bus.queues.get_mut(&replica).and_then(VecDeque::pop_front)
        };
        match event {
            Some(event) => {
                if let Some(r) = self.replicas.get_mut(&replica) {
                    r.on_event(event);
                }
                true
            }
            None => false,
        }
    }

    /// Fires every parked retry prepare and drains the fallout.
    pub fn fire_retries(&mut self) {
        let retries = mem::take(&mut self.bus.borrow_mut().retries);
        for (replica, key, _delay) in retries {
            if let Some(r) = self.replicas.get_mut(&replica) {
                r.on_event(Event::RetryPrepare(key));
            }
        }
        self.run();
    }

    /// Drops everything `from` sends towards `to` until healed.
    pub fn cut(&mut self, from: &str, to: &str) {
        self.bus.borrow_mut().cut.insert((id(from), id(to)));
    }

    pub fn heal(&mut self, from: &str, to: &str) {
        self.bus.borrow_mut().cut.remove(&(id(from), id(to)));
    }

    /// Crash-restarts a replica: all in-memory protocol state, applied
    /// state and queued traffic is gone.
    pub fn crash(&mut self, replica: &str) {
        let replica = id(replica);
        self.bus.borrow_mut().queues.remove(&replica);
        self.replicas
            .insert(replica, Cluster::spawn(replica, &self.config, &self.bus));
    }

    /// Asserts that every replica that decided a slot of `key` decided the
    /// same commands, for slots `1..=max_slot`.
    pub fn assert_agreement(&self, key: Key, max_slot: u64) {
        for slot in 1..=max_slot {
            let mut decided: Option<&[Command]> = None;
            for replica in &self.order {
                let cmds = self
                    .replicas[replica]
                    .paxos(key)
                    .and_then(|p| p.decided(slot));
                match (decided, cmds) {
                    (Some(prev), Some(cur)) => {
                        assert_eq!(prev, cur, "slot {} of key {} diverged at {}", slot, key, replica)
                    }
                    (None, Some(cur)) => decided = Some(cur),
                    _ => {}
                }
            }
        }
    }
}
