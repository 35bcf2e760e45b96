//! Authoritative session core.
//!
//! Owns every entity's motion controller, the token relay and the bootstrap
//! gate, and writes everything observers need to hear into an [`Outbox`].
//! Nothing here awaits: the socket loop in [`crate::server`] feeds inbound
//! messages in, calls [`AuthoritySession::tick`] at a fixed rate, and drains
//! the outbox afterwards.
//!
//! Participants and entities are one-to-one. `join` spawns the avatar and
//! `leave` despawns it.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use hotpotato_shared::{
    config::SessionConfig,
    error::SessionError,
    math::Vec3,
    nav::NavigationOracle,
    navmesh::RegionNavMesh,
    net::{EntityState, NetMsg, Snapshot},
    participant::{ParticipantId, ParticipantSet, Role, Roster},
    transport::{send_reliable_to_all, Outbox, Transport},
};

use crate::{
    bootstrap::SessionBootstrap,
    motion::{MotionController, MotionEvent},
    relay::{TokenRelay, Transfer},
};

pub struct AuthoritySession {
    cfg: SessionConfig,
    oracle: Arc<dyn NavigationOracle>,
    spawn_points: Vec<Vec3>,
    entities: BTreeMap<ParticipantId, MotionController>,
    roster: Roster,
    outbox: Outbox,
    relay: TokenRelay,
    bootstrap: SessionBootstrap,
    rng: StdRng,
    tick: u32,
    /// Joins so far; picks the next spawn point.
    joined: usize,
}

impl AuthoritySession {
    pub fn new(
        cfg: SessionConfig,
        oracle: Arc<dyn NavigationOracle>,
        spawn_points: Vec<Vec3>,
        rng: StdRng,
    ) -> Self {
        let relay = TokenRelay::new(cfg.token.clone());
        Self {
            cfg,
            oracle,
            spawn_points,
            entities: BTreeMap::new(),
            roster: Roster::new(),
            outbox: Outbox::new(),
            relay,
            bootstrap: SessionBootstrap::new(),
            rng,
            tick: 0,
            joined: 0,
        }
    }

    pub fn with_navmesh(cfg: SessionConfig, mesh: RegionNavMesh, rng: StdRng) -> Self {
        let spawn_points = mesh.spawn_points.clone();
        Self::new(cfg, Arc::new(mesh), spawn_points, rng)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.cfg
    }

    pub fn oracle(&self) -> &dyn NavigationOracle {
        &*self.oracle
    }

    /// Ticks run so far; also the tick stamped on the latest snapshot.
    pub fn tick_count(&self) -> u32 {
        self.tick
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn entity(&self, id: ParticipantId) -> Option<&MotionController> {
        self.entities.get(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &MotionController> + '_ {
        self.entities.values()
    }

    pub fn token_holder(&self) -> Option<ParticipantId> {
        self.relay.holder()
    }

    pub fn relay(&self) -> &TokenRelay {
        &self.relay
    }

    pub fn is_started(&self) -> bool {
        self.bootstrap.is_started()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn outbox_mut(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    /// Admits a participant and spawns its entity.
    ///
    /// The newcomer receives the whole world; everyone else receives the new
    /// entity. Returns false if `id` is already connected.
    pub fn join(&mut self, id: ParticipantId) -> bool {
        if !self.roster.join(id) {
            return false;
        }
        self.outbox.connect(id);

        let spawn = match self.spawn_points.len() {
            0 => Vec3::ZERO,
            n => self.spawn_points[self.joined % n],
        };
        self.joined += 1;
        let ctrl = MotionController::new(id, spawn, &self.cfg.motion);
        let spawn_msg = NetMsg::EntitySpawn {
            id,
            transform: ctrl.transform(),
        };
        self.entities.insert(id, ctrl);

        for other in self.entities.values() {
            let _ = self.outbox.send_reliable(
                id,
                NetMsg::EntitySpawn {
                    id: other.id(),
                    transform: other.transform(),
                },
            );
            if let Some(point) = other.destination() {
                let _ = self.outbox.send_reliable(
                    id,
                    NetMsg::DestinationUpdate {
                        entity: other.id(),
                        point,
                    },
                );
            }
        }
        if let Some(holder) = self.relay.holder() {
            let _ = self.outbox.send_reliable(id, NetMsg::TokenHolder { holder });
        }
        send_to_others(&mut self.outbox, &self.roster, id, &spawn_msg);

        info!(participant = %id, ?spawn, connected = self.roster.len(), "Participant joined");
        true
    }

    /// Removes a participant and despawns its entity.
    pub fn leave(&mut self, id: ParticipantId) -> bool {
        if !self.roster.leave(id) {
            return false;
        }
        self.outbox.disconnect(id);
        self.entities.remove(&id);
        send_reliable_to_all(
            &mut self.outbox,
            self.roster.connected(),
            &NetMsg::EntityDelete { id },
        );
        info!(participant = %id, connected = self.roster.len(), "Participant left");
        true
    }

    /// Applies one inbound reliable message from `from`.
    pub fn handle_message(&mut self, from: ParticipantId, msg: NetMsg) -> Result<(), SessionError> {
        if !self.roster.contains(from) {
            debug!(participant = %from, kind = msg.kind(), "Message from unknown participant");
            return Err(SessionError::TargetDisconnected(from));
        }
        match msg {
            NetMsg::SetDestination { point } => self.set_destination(from, point).map(|_| ()),
            NetMsg::Disconnect { reason } => {
                debug!(participant = %from, %reason, "Participant said goodbye");
                self.leave(from);
                Ok(())
            }
            NetMsg::Hello { .. } | NetMsg::UdpHello { .. } => {
                debug!(participant = %from, kind = msg.kind(), "Ignoring repeated handshake");
                Ok(())
            }
            NetMsg::StartSession
            | NetMsg::Welcome { .. }
            | NetMsg::EntitySpawn { .. }
            | NetMsg::EntityDelete { .. }
            | NetMsg::DestinationUpdate { .. }
            | NetMsg::DestinationAccepted { .. }
            | NetMsg::DestinationReached { .. }
            | NetMsg::BeginLinkTraversal { .. }
            | NetMsg::Snapshot(_)
            | NetMsg::SetTokenVisible { .. }
            | NetMsg::TokenHolder { .. } => {
                warn!(participant = %from, kind = msg.kind(), "Protocol violation: authority-only message from participant");
                Err(SessionError::AuthorityPrecondition {
                    operation: msg.kind(),
                })
            }
        }
    }

    /// Handles a destination command for `from`'s entity.
    ///
    /// On success the origin is told the resolved point and every other
    /// participant receives it as an echo. On failure nothing changes and
    /// nothing is sent.
    pub fn set_destination(
        &mut self,
        from: ParticipantId,
        point: Vec3,
    ) -> Result<Vec3, SessionError> {
        let ctrl = self
            .entities
            .get_mut(&from)
            .ok_or(SessionError::TargetDisconnected(from))?;

        match ctrl.set_destination(point, &*self.oracle, &self.cfg.motion) {
            Ok(resolved) => {
                debug!(participant = %from, requested = ?point, ?resolved, "Destination accepted");
                let _ = self
                    .outbox
                    .send_reliable(from, NetMsg::DestinationAccepted { point: resolved });
                send_to_others(
                    &mut self.outbox,
                    &self.roster,
                    from,
                    &NetMsg::DestinationUpdate {
                        entity: from,
                        point: resolved,
                    },
                );
                Ok(resolved)
            }
            Err(e) => {
                warn!(participant = %from, requested = ?point, error = %e, "Destination rejected");
                Err(e)
            }
        }
    }

    /// Advances every entity one fixed step and queues the snapshot.
    pub fn tick(&mut self, dt: f32) -> Vec<(ParticipantId, MotionEvent)> {
        let mut all_events = Vec::new();
        for (&id, ctrl) in self.entities.iter_mut() {
            for event in ctrl.tick(dt, &*self.oracle, &self.cfg.motion) {
                match event {
                    MotionEvent::LinkEntered(link) => send_to_others(
                        &mut self.outbox,
                        &self.roster,
                        id,
                        &NetMsg::BeginLinkTraversal { entity: id, link },
                    ),
                    MotionEvent::Arrived => {
                        send_reliable_to_all(
                            &mut self.outbox,
                            self.roster.iter(),
                            &NetMsg::DestinationReached { entity: id },
                        );
                    }
                    MotionEvent::Placed(_) | MotionEvent::LinkCompleted => {}
                }
                all_events.push((id, event));
            }
        }

        self.tick = self.tick.wrapping_add(1);
        let entities = self
            .entities
            .values()
            .map(|c| {
                let t = c.transform();
                EntityState {
                    id: c.id(),
                    position: t.position,
                    rotation: t.rotation,
                }
            })
            .collect();
        self.outbox.broadcast(NetMsg::Snapshot(Snapshot {
            tick: self.tick,
            entities,
        }));
        all_events
    }

    /// Asks the bootstrap gate to start the token relay.
    pub fn start_relay(&mut self, role: Role, now: Duration) -> Result<bool, SessionError> {
        self.bootstrap.start_relay(
            role,
            now,
            &mut self.relay,
            &self.roster,
            &mut self.outbox,
            &mut self.rng,
        )
    }

    /// Runs a relay cycle if one is due at `now` on the session clock.
    pub fn poll_relay(&mut self, now: Duration) -> Option<Result<Transfer, SessionError>> {
        self.relay
            .poll(now, &self.roster, &mut self.outbox, &mut self.rng)
    }
}

fn send_to_others(outbox: &mut Outbox, roster: &Roster, except: ParticipantId, msg: &NetMsg) {
    send_reliable_to_all(outbox, roster.iter().filter(|&p| p != except), msg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotpotato_shared::{config::TokenConfig, nav::NavError, navmesh::Floor};
    use rand::SeedableRng;

    const DT: f32 = 1.0 / 30.0;

    fn session() -> AuthoritySession {
        let cfg = SessionConfig {
            token: TokenConfig {
                min_interval: 10.0,
                max_interval: 10.0,
                transfer_on_start: false,
            },
            ..SessionConfig::default()
        };
        AuthoritySession::with_navmesh(cfg, RegionNavMesh::demo(), StdRng::seed_from_u64(11))
    }

    fn reliable_to(s: &AuthoritySession, to: ParticipantId) -> Vec<NetMsg> {
        s.outbox()
            .pending_reliable()
            .iter()
            .filter(|(p, _)| *p == to)
            .map(|(_, m)| m.clone())
            .collect()
    }

    #[test]
    fn newcomer_receives_existing_world() {
        let mut s = session();
        let (a, b) = (ParticipantId(1), ParticipantId(2));
        s.join(a);
        s.outbox_mut().drain_reliable();
        s.join(b);

        let to_b = reliable_to(&s, b);
        let spawned: Vec<_> = to_b
            .iter()
            .filter_map(|m| match m {
                NetMsg::EntitySpawn { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        assert_eq!(spawned, vec![a, b]);

        let to_a = reliable_to(&s, a);
        assert!(matches!(to_a.as_slice(), [NetMsg::EntitySpawn { id, .. }] if *id == b));
        assert!(!s.join(b));
    }

    #[test]
    fn accepted_destination_is_echoed_to_everyone_but_origin() {
        let mut s = session();
        let (a, b, c) = (ParticipantId(1), ParticipantId(2), ParticipantId(3));
        [a, b, c].into_iter().for_each(|p| {
            s.join(p);
        });
        s.tick(DT);
        s.outbox_mut().drain_reliable();

        let resolved = s.set_destination(a, Vec3::new(2.0, 0.0, 2.0)).unwrap();
        let echo = NetMsg::DestinationUpdate {
            entity: a,
            point: resolved,
        };
        assert_eq!(
            reliable_to(&s, a),
            vec![NetMsg::DestinationAccepted { point: resolved }]
        );
        assert_eq!(reliable_to(&s, b), vec![echo.clone()]);
        assert_eq!(reliable_to(&s, c), vec![echo]);
    }

    #[test]
    fn rejected_destination_sends_nothing() {
        let mut s = session();
        let (a, b) = (ParticipantId(1), ParticipantId(2));
        s.join(a);
        s.join(b);
        s.tick(DT);
        s.outbox_mut().drain_reliable();

        let before = s.entity(a).unwrap().position();
        let res = s.set_destination(a, Vec3::new(300.0, 0.0, 0.0));
        assert!(matches!(res, Err(SessionError::NavigationUnresolvable(_))));
        assert!(s.outbox().pending_reliable().is_empty());

        s.tick(DT);
        assert_eq!(s.entity(a).unwrap().position(), before);
    }

    #[test]
    fn unreachable_floor_gets_no_reply() {
        let mesh = RegionNavMesh {
            floors: vec![
                Floor {
                    min_x: -10.0,
                    max_x: 10.0,
                    min_z: -5.0,
                    max_z: 5.0,
                    height: 0.0,
                },
                Floor {
                    min_x: 20.0,
                    max_x: 30.0,
                    min_z: -5.0,
                    max_z: 5.0,
                    height: 0.0,
                },
            ],
            links: Vec::new(),
            spawn_points: vec![Vec3::ZERO],
        };
        let mut s =
            AuthoritySession::with_navmesh(SessionConfig::default(), mesh, StdRng::seed_from_u64(3));
        let a = ParticipantId(1);
        s.join(a);
        s.tick(DT);
        s.outbox_mut().drain_reliable();

        let res = s.set_destination(a, Vec3::new(25.0, 0.0, 0.0));
        assert!(matches!(
            res,
            Err(SessionError::NavigationUnresolvable(NavError::NoPath { .. }))
        ));
        assert!(s.outbox().pending_reliable().is_empty());
        assert_eq!(s.entity(a).unwrap().destination(), None);
    }

    #[test]
    fn arrival_is_announced_to_everyone() {
        let mut s = session();
        let (a, b) = (ParticipantId(1), ParticipantId(2));
        s.join(a);
        s.join(b);
        s.tick(DT);
        let start = s.entity(a).unwrap().position();
        s.set_destination(a, start + Vec3::new(2.0, 0.0, 0.0)).unwrap();
        s.outbox_mut().drain_reliable();

        let mut arrived = false;
        for _ in 0..600 {
            if s.tick(DT)
                .iter()
                .any(|(id, e)| *id == a && *e == MotionEvent::Arrived)
            {
                arrived = true;
                break;
            }
        }
        assert!(arrived);
        assert_eq!(s.entity(a).unwrap().destination(), None);
        for to in [a, b] {
            assert_eq!(
                reliable_to(&s, to),
                vec![NetMsg::DestinationReached { entity: a }]
            );
        }
    }

    #[test]
    fn authority_only_messages_from_participants_are_rejected() {
        let mut s = session();
        let a = ParticipantId(1);
        s.join(a);
        s.outbox_mut().drain_reliable();

        for msg in [
            NetMsg::StartSession,
            NetMsg::SetTokenVisible { visible: true },
            NetMsg::TokenHolder { holder: a },
            NetMsg::DestinationReached { entity: a },
        ] {
            assert!(matches!(
                s.handle_message(a, msg),
                Err(SessionError::AuthorityPrecondition { .. })
            ));
        }
        assert!(!s.is_started());
        assert_eq!(s.token_holder(), None);
        assert!(s.outbox().pending_reliable().is_empty());
    }

    #[test]
    fn link_entry_is_announced_to_other_participants() {
        let mut s = session();
        let (a, b) = (ParticipantId(1), ParticipantId(2));
        s.join(a);
        s.join(b);
        s.tick(DT);
        s.set_destination(a, Vec3::new(-4.0, 0.0, 20.0)).unwrap();
        s.outbox_mut().drain_reliable();

        let mut announced = false;
        for _ in 0..2_000 {
            let events = s.tick(DT);
            if events
                .iter()
                .any(|(id, e)| *id == a && matches!(e, MotionEvent::LinkEntered(_)))
            {
                announced = true;
                break;
            }
        }
        assert!(announced);
        assert!(!reliable_to(&s, a)
            .iter()
            .any(|m| matches!(m, NetMsg::BeginLinkTraversal { .. })));
        assert!(matches!(
            reliable_to(&s, b).as_slice(),
            [NetMsg::BeginLinkTraversal { entity, .. }] if *entity == a
        ));
    }

    #[test]
    fn every_tick_broadcasts_one_snapshot() {
        let mut s = session();
        s.join(ParticipantId(1));
        s.join(ParticipantId(2));
        s.tick(DT);
        s.tick(DT);
        let snaps = s.outbox_mut().drain_broadcast();
        assert_eq!(snaps.len(), 2);
        match &snaps[1] {
            NetMsg::Snapshot(snap) => {
                assert_eq!(snap.tick, 2);
                assert_eq!(snap.entities.len(), 2);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn leave_despawns_and_notifies_rest() {
        let mut s = session();
        let (a, b) = (ParticipantId(1), ParticipantId(2));
        s.join(a);
        s.join(b);
        s.outbox_mut().drain_reliable();

        assert!(s.leave(a));
        assert!(s.entity(a).is_none());
        assert_eq!(reliable_to(&s, b), vec![NetMsg::EntityDelete { id: a }]);
        assert!(matches!(
            s.handle_message(a, NetMsg::SetDestination { point: Vec3::ZERO }),
            Err(SessionError::TargetDisconnected(_))
        ));
    }

    #[test]
    fn relay_runs_on_session_clock_once_started() {
        let mut s = session();
        s.join(ParticipantId(1));
        s.join(ParticipantId(2));
        assert_eq!(s.start_relay(Role::Authority, Duration::ZERO), Ok(true));
        assert!(s.poll_relay(Duration::from_secs(9)).is_none());

        let t = s.poll_relay(Duration::from_secs(10)).unwrap().unwrap();
        assert_eq!(s.token_holder(), Some(t.holder));
        assert_eq!(s.start_relay(Role::Authority, Duration::from_secs(11)), Ok(false));
    }
}
