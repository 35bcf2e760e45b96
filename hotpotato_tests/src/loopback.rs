//! In-memory loopback between one authority and many replicas.
//!
//! Reliable messages are always delivered, in order, to their target.
//! Best-effort messages (snapshots) go through a seeded lossy channel that
//! can drop them or hold them back a round so they arrive out of order.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use hotpotato_client::{input::pick_destination, replica::ReplicaWorld};
use hotpotato_server::{motion::MotionEvent, session::AuthoritySession};
use hotpotato_shared::{
    config::SessionConfig,
    error::SessionError,
    math::Vec3,
    navmesh::RegionNavMesh,
    net::NetMsg,
    participant::ParticipantId,
};

/// Best-effort channel conditions.
#[derive(Clone, Debug)]
pub struct LossConfig {
    /// Probability a datagram is dropped (0.0 - 1.0)
    pub loss_rate: f64,
    /// Probability a datagram is held back one round (0.0 - 1.0)
    pub reorder_prob: f64,
}

impl LossConfig {
    /// Perfect channel
    pub fn none() -> Self {
        LossConfig {
            loss_rate: 0.0,
            reorder_prob: 0.0,
        }
    }

    /// Heavy loss with some reordering
    pub fn lossy() -> Self {
        LossConfig {
            loss_rate: 0.3,
            reorder_prob: 0.1,
        }
    }
}

/// Delivery counters for the best-effort channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub delivered: u64,
    pub dropped: u64,
    pub reordered: u64,
}

pub struct Loopback {
    pub authority: AuthoritySession,
    replicas: BTreeMap<ParticipantId, ReplicaWorld>,
    loss: LossConfig,
    rng: StdRng,
    held: Vec<(ParticipantId, NetMsg)>,
    stats: ChannelStats,
    next_id: u32,
}

impl Loopback {
    /// Authority on the demo arena. `seed` drives both the session and the channel.
    pub fn new(cfg: SessionConfig, loss: LossConfig, seed: u64) -> Self {
        Self::with_navmesh(cfg, RegionNavMesh::demo(), loss, seed)
    }

    pub fn with_navmesh(
        cfg: SessionConfig,
        mesh: RegionNavMesh,
        loss: LossConfig,
        seed: u64,
    ) -> Self {
        let authority = AuthoritySession::with_navmesh(cfg, mesh, StdRng::seed_from_u64(seed));
        Self {
            authority,
            replicas: BTreeMap::new(),
            loss,
            rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
            held: Vec::new(),
            stats: ChannelStats::default(),
            next_id: 1,
        }
    }

    /// Connects a new participant with its own replica.
    pub fn join(&mut self) -> ParticipantId {
        let id = ParticipantId(self.next_id);
        self.next_id += 1;

        let mut replica = ReplicaWorld::new(self.authority.config().motion.clone());
        replica.apply(NetMsg::Welcome { participant: id });
        self.replicas.insert(id, replica);
        self.authority.join(id);
        self.deliver();
        id
    }

    pub fn leave(&mut self, id: ParticipantId) {
        self.replicas.remove(&id);
        self.authority.leave(id);
        self.deliver();
    }

    pub fn replica(&self, id: ParticipantId) -> Option<&ReplicaWorld> {
        self.replicas.get(&id)
    }

    pub fn replicas(&self) -> impl Iterator<Item = (ParticipantId, &ReplicaWorld)> + '_ {
        self.replicas.iter().map(|(id, r)| (*id, r))
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// What a client does on a click: snap locally, then send.
    pub fn command(&mut self, from: ParticipantId, picked: Vec3) -> Result<Vec3, SessionError> {
        let pick_radius = self.authority.config().motion.pick_radius;
        let point = pick_destination(self.authority.oracle(), picked, pick_radius)?;
        let res = self.authority.set_destination(from, point);
        self.deliver();
        res
    }

    /// One authority tick, then delivery, then one render frame everywhere.
    pub fn step(&mut self, dt: f32) -> Vec<(ParticipantId, MotionEvent)> {
        let events = self.authority.tick(dt);
        self.deliver();
        for r in self.replicas.values_mut() {
            r.render(dt);
        }
        events
    }

    /// Moves everything queued on the authority to the replicas.
    pub fn deliver(&mut self) {
        let outbox = self.authority.outbox_mut();
        let reliable = outbox.drain_reliable();
        let broadcast = outbox.drain_broadcast();

        for (to, msg) in reliable {
            if let Some(r) = self.replicas.get_mut(&to) {
                r.apply(msg);
            }
        }

        let late = std::mem::take(&mut self.held);
        for msg in broadcast {
            let targets: Vec<ParticipantId> = self.replicas.keys().copied().collect();
            for to in targets {
                if self.rng.gen_bool(self.loss.loss_rate) {
                    self.stats.dropped += 1;
                } else if self.rng.gen_bool(self.loss.reorder_prob) {
                    self.stats.reordered += 1;
                    self.held.push((to, msg.clone()));
                } else {
                    self.apply_best_effort(to, msg.clone());
                }
            }
        }
        // Held datagrams land after newer ones.
        for (to, msg) in late {
            self.apply_best_effort(to, msg);
        }
    }

    fn apply_best_effort(&mut self, to: ParticipantId, msg: NetMsg) {
        if let Some(r) = self.replicas.get_mut(&to) {
            self.stats.delivered += 1;
            r.apply(msg);
        }
    }
}
