//! Replica world.
//!
//! The client's read-only mirror of the session. It changes only through
//! messages from the authority; it never decides anything on its own.
//!
//! Per entity it keeps:
//! - a smoothed transform chasing the latest snapshot,
//! - the destination the authority adopted, cleared on arrival,
//! - an optional link replay.
//!
//! A link replay moves a separate visual transform through the same two-phase
//! traversal the authority runs. While it is active, [`ReplicaWorld::render_transform`]
//! reports the replay; the smoothed transform keeps following snapshots
//! underneath so nothing authoritative is overwritten.

use std::collections::BTreeMap;

use tracing::{debug, info};

use hotpotato_shared::{
    config::MotionConfig,
    link::{LinkTraversal, TraversalStatus},
    math::{Transform, Vec3},
    nav::OffMeshLinkData,
    net::{NetMsg, Snapshot},
    participant::ParticipantId,
};

use crate::interp::SmoothedTransform;

#[derive(Debug, Clone)]
struct LinkReplay {
    traversal: LinkTraversal,
    visual: Transform,
}

#[derive(Debug, Clone)]
pub struct ReplicaEntity {
    id: ParticipantId,
    smoothed: SmoothedTransform,
    destination: Option<Vec3>,
    replay: Option<LinkReplay>,
}

impl ReplicaEntity {
    fn new(id: ParticipantId, at: Transform) -> Self {
        Self {
            id,
            smoothed: SmoothedTransform::new(at),
            destination: None,
            replay: None,
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    /// Interpolated transform, ignoring any link replay.
    pub fn displayed(&self) -> Transform {
        self.smoothed.displayed()
    }

    /// Latest authoritative transform received.
    pub fn target(&self) -> Transform {
        self.smoothed.target()
    }

    pub fn destination(&self) -> Option<Vec3> {
        self.destination
    }

    pub fn is_replaying_link(&self) -> bool {
        self.replay.is_some()
    }

    /// What to draw this frame.
    pub fn render_transform(&self) -> Transform {
        match &self.replay {
            Some(r) => r.visual,
            None => self.smoothed.displayed(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaWorld {
    local: Option<ParticipantId>,
    motion: MotionConfig,
    entities: BTreeMap<ParticipantId, ReplicaEntity>,
    token_holder: Option<ParticipantId>,
    token_visible: bool,
    last_snapshot_tick: Option<u32>,
}

impl ReplicaWorld {
    pub fn new(motion: MotionConfig) -> Self {
        Self {
            local: None,
            motion,
            entities: BTreeMap::new(),
            token_holder: None,
            token_visible: false,
            last_snapshot_tick: None,
        }
    }

    /// The participant this replica belongs to, once welcomed.
    pub fn local(&self) -> Option<ParticipantId> {
        self.local
    }

    pub fn entity(&self, id: ParticipantId) -> Option<&ReplicaEntity> {
        self.entities.get(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &ReplicaEntity> + '_ {
        self.entities.values()
    }

    pub fn render_transform(&self, id: ParticipantId) -> Option<Transform> {
        self.entities.get(&id).map(ReplicaEntity::render_transform)
    }

    pub fn destination(&self, id: ParticipantId) -> Option<Vec3> {
        self.entities.get(&id).and_then(|e| e.destination)
    }

    /// Mirrored token holder, as last announced.
    pub fn token_holder(&self) -> Option<ParticipantId> {
        self.token_holder
    }

    /// Whether this participant's own token indicator is shown.
    pub fn token_visible(&self) -> bool {
        self.token_visible
    }

    pub fn last_snapshot_tick(&self) -> Option<u32> {
        self.last_snapshot_tick
    }

    /// Applies one message from the authority.
    pub fn apply(&mut self, msg: NetMsg) {
        match msg {
            NetMsg::Welcome { participant } => {
                self.local = Some(participant);
            }
            NetMsg::EntitySpawn { id, transform } => {
                self.entities
                    .entry(id)
                    .or_insert_with(|| ReplicaEntity::new(id, transform));
                debug!(entity = %id, "Entity spawned");
            }
            NetMsg::EntityDelete { id } => {
                self.entities.remove(&id);
                debug!(entity = %id, "Entity deleted");
            }
            NetMsg::DestinationUpdate { entity, point } => self.set_destination(entity, Some(point)),
            NetMsg::DestinationAccepted { point } => {
                if let Some(local) = self.local {
                    self.set_destination(local, Some(point));
                }
            }
            NetMsg::DestinationReached { entity } => self.set_destination(entity, None),
            NetMsg::BeginLinkTraversal { entity, link } => self.begin_replay(entity, link),
            NetMsg::Snapshot(snap) => self.apply_snapshot(snap),
            NetMsg::SetTokenVisible { visible } => {
                self.token_visible = visible;
            }
            NetMsg::TokenHolder { holder } => {
                if self.token_holder != Some(holder) {
                    info!(%holder, mine = self.local == Some(holder), "Token holder changed");
                }
                self.token_holder = Some(holder);
            }
            other => debug!(kind = other.kind(), "Ignoring message on replica"),
        }
    }

    fn set_destination(&mut self, entity: ParticipantId, point: Option<Vec3>) {
        if let Some(e) = self.entities.get_mut(&entity) {
            e.destination = point;
        }
    }

    fn begin_replay(&mut self, entity: ParticipantId, link: OffMeshLinkData) {
        if self.local == Some(entity) {
            return;
        }
        let Some(e) = self.entities.get_mut(&entity) else {
            return;
        };
        e.replay = Some(LinkReplay {
            traversal: LinkTraversal::new(link, (&self.motion).into()),
            visual: e.smoothed.displayed(),
        });
    }

    fn apply_snapshot(&mut self, snap: Snapshot) {
        if self.last_snapshot_tick.is_some_and(|last| snap.tick < last) {
            debug!(tick = snap.tick, last = ?self.last_snapshot_tick, "Stale snapshot dropped");
            return;
        }
        self.last_snapshot_tick = Some(snap.tick);
        for state in snap.entities {
            if let Some(e) = self.entities.get_mut(&state.id) {
                e.smoothed.set_target(Transform {
                    position: state.position,
                    rotation: state.rotation,
                });
            }
        }
    }

    /// Advances interpolation and link replays by one render frame.
    pub fn render(&mut self, dt: f32) {
        let follow_rate = self.motion.follow_rate;
        for e in self.entities.values_mut() {
            e.smoothed.advance(dt, follow_rate);
            let done = e.replay.as_mut().is_some_and(|r| {
                r.traversal.advance(dt, &mut r.visual) == TraversalStatus::Done
            });
            if done {
                e.replay = None;
            }
        }
    }
}
