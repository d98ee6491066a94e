use crate::command::{Executor, Request, Transport};
use crate::config::Config;
use crate::id::Zone;
use crate::messages::{Accept, Accepted, Commit, LeaderChange, Message, Prepare, Promise};
use crate::quorum::{Quorum, QuorumSpec};
use crate::stat::Stat;
use crate::{Ballot, Command, Key, Slot, ID};
use rand::{thread_rng, Rng};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One slot of a key's log, in flight or decided.
#[derive(Debug)]
struct Instance {
    ballot: Ballot,
    commands: Vec<Command>,
    committed: bool,
    /// Present only on the replica that proposed the slot. Owning the
    /// request is owning the reply path; when the slot is lost the request
    /// goes back to the inbound channel, never away.
    request: Option<Request>,
    quorum: Quorum,
    proposed_at: Instant,
}

impl Instance {
    fn new(ballot: Ballot, commands: Vec<Command>, committed: bool, spec: &Arc<QuorumSpec>) -> Instance {
        Instance {
            ballot,
            commands,
            committed,
            request: None,
            quorum: Quorum::new(spec.clone()),
            proposed_at: Instant::now(),
        }
    }
}

/// A complete Multi-Paxos state machine scoped to a single key.
///
/// Instances are created lazily by the [`Replica`](crate::Replica) on the
/// first message concerning their key and live for the rest of the
/// process. Every handler runs under the replica's single message loop and
/// emits its messages through the [`Transport`] capability passed in, so
/// the state machine itself holds no channels and stays synchronous.
pub struct Paxos {
    key: Key,
    id: ID,
    config: Arc<Config>,
    spec: Arc<QuorumSpec>,

    /// Highest ballot seen or produced for this key. Never decreases.
    ballot: Ballot,
    /// Whether this replica leads the key, i.e. completed phase 1 at
    /// `ballot`.
    active: bool,
    /// Phase 1 acknowledgement tracking for the current attempt.
    quorum: Quorum,
    /// Requests buffered while phase 1 is in flight.
    requests: Vec<Request>,

    cmds: HashMap<Slot, Instance>,
    /// Highest slot used or observed.
    slot: Slot,
    /// Highest slot up to which the log is contiguously committed.
    commit: Slot,

    /// At most one backed-off retry prepare may be pending per key.
    sleeping: bool,
    stat: Stat,
}

impl Paxos {
    pub fn new(key: Key, id: ID, config: Arc<Config>, spec: Arc<QuorumSpec>) -> Paxos {
        let stat = Stat::new(config.policy, config.threshold);
        let quorum = Quorum::new(spec.clone());
        Paxos {
            key,
            id,
            config,
            spec,
            ballot: Ballot::ZERO,
            active: false,
            quorum,
            requests: Vec::new(),
            cmds: HashMap::new(),
            slot: 0,
            commit: 0,
            sleeping: false,
            stat,
        }
    }

    /// Key this state machine is scoped to.
    pub fn key(&self) -> Key {
        self.key
    }

    /// Whether this replica currently leads the key.
    pub fn active(&self) -> bool {
        self.active
    }

    /// Highest ballot seen or produced for this key.
    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    /// Highest slot used or observed.
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Highest slot up to which the log is contiguously committed.
    pub fn commit(&self) -> Slot {
        self.commit
    }

    /// Commands decided at `slot`, once this replica marked it committed.
    pub fn decided(&self, slot: Slot) -> Option<&[Command]> {
        self.cmds
            .get(&slot)
            .filter(|ins| ins.committed)
            .map(|ins| ins.commands.as_slice())
    }

    /// Client request entry point.
    ///
    /// The leader opens a new slot right away; a replica mid-election
    /// buffers the request; a follower that knows the leader redirects the
    /// client when handover is enabled, and otherwise buffers the request
    /// and runs for leadership itself.
    pub fn on_request<T: Transport>(&mut self, req: Request, t: &mut T) {
        if self.active {
            let client = req.command.client_id;
            self.open_slot(req, t);
            if let Some(to) = self.stat.hit(ID::site(client.zone())) {
                if to.zone() != self.id.zone() {
                    debug!("{} handing key {} over to {}", self.id, self.key, to);
                    t.send(
                        to,
                        LeaderChange { key: self.key, from: self.id, to, ballot: self.ballot }
                            .into(),
                    );
                }
            }
        } else if self.ballot.leader() == self.id {
            // phase 1 in flight; hold the request until the quorum answers
            self.requests.push(req);
        } else if self.config.threshold > 0 && !self.ballot.is_zero() {
            req.redirect(self.ballot.leader());
        } else {
            self.requests.push(req);
            self.prepare(t);
        }
    }

    /// Phase 1: claim the next ballot of this replica and ask everyone to
    /// promise it. Does nothing while this replica is already the active
    /// leader.
    pub(crate) fn prepare<T: Transport>(&mut self, t: &mut T) {
        if self.active {
            return;
        }
        self.ballot = self.ballot.next(self.id);
        self.quorum.reset();
        self.quorum.ack(self.id);
        debug!("{} preparing key {} at {:?}", self.id, self.key, self.ballot);
        t.broadcast(Prepare { key: self.key, ballot: self.ballot }.into());
    }

    pub fn on_prepare<T: Transport>(&mut self, m: Prepare, t: &mut T) {
        if m.ballot > self.ballot {
            self.ballot = m.ballot;
            self.active = false;
            if !self.requests.is_empty() && !self.sleeping {
                self.back_off(t);
            }
        }
        t.send(
            m.ballot.leader(),
            Promise { key: self.key, from: self.id, ballot: self.ballot, pre_slot: self.slot }
                .into(),
        );
    }

    /// Phase 1b handling at the proposer.
    ///
    /// A promise may raise the slot watermark learned from the peer;
    /// uncommitted entries below the watermark are not replayed here,
    /// their recovery stays with the proposers that own them.
    pub fn on_promise<T: Transport>(&mut self, m: Promise, t: &mut T) {
        if m.ballot < self.ballot || self.active {
            trace!("{} ignoring stale {:?}", self.id, m);
            return;
        }

        if m.pre_slot > self.slot {
            self.slot = m.pre_slot;
        }

        if m.ballot == self.ballot && m.ballot.leader() == self.id {
            self.quorum.ack(m.from);
            if self.quorum.q1() {
                self.active = true;
                for req in mem::take(&mut self.requests) {
                    self.open_slot(req, t);
                }
            }
        } else {
            // someone else holds a higher ballot; fall back and retry later
            self.ballot = m.ballot;
            self.active = false;
            if !self.sleeping {
                self.back_off(t);
            }
        }
    }

    /// Phase 2a handling at an acceptor.
    ///
    /// An equal-or-higher ballot replaces whatever occupied the slot; a
    /// request this replica proposed there goes back to the inbound
    /// channel. The reply always carries this replica's own ballot, which
    /// tells a superseded leader what preempted it.
    pub fn on_accept<T: Transport>(&mut self, m: Accept, t: &mut T) {
        let Accept { ballot, slot, commands, .. } = m;
        if ballot >= self.ballot {
            self.ballot = ballot;
            self.active = false;
            self.slot = self.slot.max(slot);

            if let Some(prev) = self.cmds.get_mut(&slot) {
                if let Some(req) = prev.request.take() {
                    warn!(
                        "{} displaced from slot {} of key {}, requeueing request",
                        self.id, slot, self.key
                    );
                    t.repost(req);
                }
            }
            self.cmds.insert(slot, Instance::new(ballot, commands, false, &self.spec));
        }

        t.send(
            ballot.leader(),
            Accepted { key: self.key, from: self.id, ballot: self.ballot, slot }.into(),
        );
    }

    /// Phase 2b handling at the proposer. A quorum decides the slot: the
    /// commit is broadcast, the committed prefix advances and the original
    /// client gets its reply. A higher ballot in the reply means the slot
    /// was lost; its request is requeued and the slot forgotten.
    pub fn on_accepted<T: Transport>(&mut self, m: Accepted, t: &mut T) {
        let mut decided = None;
        let mut lost = false;
        match self.cmds.get_mut(&m.slot) {
            None => {
                warn!("{} has no slot {} of key {} for {:?}", self.id, m.slot, self.key, m);
                return;
            }
            Some(ins) => {
                if ins.committed || m.ballot < ins.ballot {
                    trace!("{} ignoring old {:?}", self.id, m);
                } else if m.ballot == ins.ballot {
                    ins.quorum.ack(m.from);
                    if ins.quorum.q2() {
                        ins.committed = true;
                        debug!(
                            "{} committed slot {} of key {} after {:?}",
                            self.id,
                            m.slot,
                            self.key,
                            ins.proposed_at.elapsed()
                        );
                        decided = Some((ins.ballot, ins.commands.clone(), ins.request.take()));
                    }
                } else {
                    lost = true;
                }
            }
        }

        if lost {
            warn!(
                "{} lost slot {} of key {} to {:?}, requeueing request",
                self.id, m.slot, self.key, m.ballot
            );
            if let Some(ins) = self.cmds.remove(&m.slot) {
                if let Some(req) = ins.request {
                    t.repost(req);
                }
            }
        }

        if let Some((ballot, commands, request)) = decided {
            self.advance_commit(t);
            t.broadcast(Commit { key: self.key, ballot, slot: m.slot, commands }.into());
            if let Some(req) = request {
                req.granted(self.id);
            }
        }

        if m.ballot > self.ballot {
            self.ballot = m.ballot;
            self.active = false;
        }
    }

    pub fn on_commit<T: Transport>(&mut self, m: Commit, t: &mut T) {
        let Commit { ballot, slot, commands, .. } = m;
        self.ballot = self.ballot.max(ballot);
        self.slot = self.slot.max(slot);

        match self.cmds.entry(slot) {
            // commands of an existing instance already agree with the
            // decided ones
            Entry::Occupied(mut e) => e.get_mut().committed = true,
            Entry::Vacant(e) => {
                e.insert(Instance::new(ballot, commands, true, &self.spec));
            }
        }

        self.advance_commit(t);
    }

    pub fn on_leader_change<T: Transport>(&mut self, m: LeaderChange, t: &mut T) {
        if m.to == self.id {
            debug!("{} taking over key {} from {}", self.id, self.key, m.from);
            self.ballot = self.ballot.max(m.ballot);
            self.prepare(t);
        }
    }

    /// Timer-driven follow-up to a backed-off prepare.
    pub fn on_retry<T: Transport>(&mut self, t: &mut T) {
        self.sleeping = false;
        self.prepare(t);
    }

    /// Phase 2: put the request into the next slot and fan the accept out
    /// within this replica's own zone, or to a minimal zone quorum when
    /// thrifty.
    fn open_slot<T: Transport>(&mut self, req: Request, t: &mut T) {
        self.slot += 1;
        let slot = self.slot;
        let commands = vec![req.command.clone()];

        let mut instance = Instance::new(self.ballot, commands.clone(), false, &self.spec);
        instance.request = Some(req);
        instance.quorum.ack(self.id);
        self.cmds.insert(slot, instance);

        trace!("{} opened slot {} of key {} at {:?}", self.id, slot, self.key, self.ballot);
        let accept: Message =
            Accept { key: self.key, ballot: self.ballot, slot, commands }.into();
        let zone = self.id.zone();
        if self.config.thrifty {
            for peer in self.zone_quorum(zone) {
                t.send(peer, accept.clone());
            }
        } else {
            t.multicast(zone, accept);
        }
    }

    /// Minimal set of own-zone peers whose acks, together with ours, form
    /// a zone majority. Deterministic by id order.
    fn zone_quorum(&self, zone: Zone) -> Vec<ID> {
        let mut ids = self.config.zone_ids(zone);
        ids.retain(|id| *id != self.id);
        ids.truncate(self.spec.zone_size(zone) / 2);
        ids
    }

    fn back_off<T: Transport>(&mut self, t: &mut T) {
        self.sleeping = true;
        let jitter = thread_rng().gen_range(0..100);
        t.schedule_retry(self.key, Duration::from_millis(self.config.backoff + jitter));
    }

    /// Greedily advances the committed prefix, handing each newly
    /// committed slot to the executor in order.
    fn advance_commit<T: Transport>(&mut self, t: &mut T) {
        loop {
            let next = self.commit + 1;
            match self.cmds.get(&next) {
                Some(ins) if ins.committed => {
                    t.executor().execute(self.key, next, &ins.commands);
                    self.commit = next;
                }
                _ => return,
            }
        }
    }
}
