//! Authority-side entity motion.
//!
//! One [`MotionController`] per participant avatar. The server's fixed tick
//! calls [`MotionController::tick`]; destination commands go through
//! [`MotionController::set_destination`]. Only the authority owns these, so
//! every write to an entity's transform happens here.

use tracing::{debug, error, info, warn};

use hotpotato_shared::{
    config::MotionConfig,
    error::SessionError,
    link::{LinkTraversal, TraversalStatus},
    math::{Quat, Transform, Vec3},
    nav::{NavPath, NavigationOracle, OffMeshLinkData},
    participant::ParticipantId,
};

/// Locomotion state of an authoritative entity.
#[derive(Debug, Clone, PartialEq)]
pub enum PathState {
    Idle,
    Following(NavPath),
    /// Crossing a link. `resume` is the rest of the path after the link.
    TraversingLink {
        traversal: LinkTraversal,
        resume: NavPath,
    },
}

impl PathState {
    pub fn name(&self) -> &'static str {
        match self {
            PathState::Idle => "idle",
            PathState::Following(_) => "following",
            PathState::TraversingLink { .. } => "traversing_link",
        }
    }
}

/// Something that happened during a tick that observers may need to hear about.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionEvent {
    Placed(Vec3),
    LinkEntered(OffMeshLinkData),
    LinkCompleted,
    Arrived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Pending { attempts_left: u32 },
    Placed,
    Unplaced,
}

#[derive(Debug, Clone)]
pub struct MotionController {
    id: ParticipantId,
    transform: Transform,
    destination: Option<Vec3>,
    path_state: PathState,
    /// Accepted path waiting for the next tick boundary.
    pending: Option<NavPath>,
    is_off_mesh: bool,
    placement: Placement,
}

impl MotionController {
    pub fn new(id: ParticipantId, spawn: Vec3, cfg: &MotionConfig) -> Self {
        let placement = match cfg.placement_attempts {
            0 => Placement::Unplaced,
            n => Placement::Pending { attempts_left: n },
        };
        Self {
            id,
            transform: Transform::at(spawn),
            destination: None,
            path_state: PathState::Idle,
            pending: None,
            is_off_mesh: false,
            placement,
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn position(&self) -> Vec3 {
        self.transform.position
    }

    pub fn destination(&self) -> Option<Vec3> {
        self.destination
    }

    pub fn path_state(&self) -> &PathState {
        &self.path_state
    }

    pub fn is_off_mesh(&self) -> bool {
        self.is_off_mesh
    }

    pub fn has_pending_path(&self) -> bool {
        self.pending.is_some()
    }

    /// Validates a destination command and queues the new path.
    ///
    /// If the entity is off the surface it is snapped back within
    /// `correction_radius` first. On error nothing changes. On success the
    /// resolved destination is returned; the path starts at the next tick, or
    /// after the link in progress completes.
    pub fn set_destination(
        &mut self,
        target: Vec3,
        oracle: &dyn NavigationOracle,
        cfg: &MotionConfig,
    ) -> Result<Vec3, SessionError> {
        let corrected = if self.is_off_mesh || oracle.is_on_surface(self.transform.position) {
            None
        } else {
            Some(oracle.sample_point(self.transform.position, cfg.correction_radius)?)
        };

        let origin = match &self.path_state {
            PathState::TraversingLink { traversal, .. } => traversal.link().end,
            _ => corrected.unwrap_or(self.transform.position),
        };
        let resolved = oracle.sample_point(target, cfg.correction_radius)?;
        let path = oracle.compute_path(origin, resolved)?;

        if let Some(p) = corrected {
            warn!(participant = %self.id, from = ?self.transform.position, to = ?p, "Entity off surface, corrected");
            self.transform.position = p;
            self.placement = Placement::Placed;
        }
        self.pending = Some(path);
        self.destination = Some(resolved);
        Ok(resolved)
    }

    /// Advances one fixed step.
    pub fn tick(
        &mut self,
        dt: f32,
        oracle: &dyn NavigationOracle,
        cfg: &MotionConfig,
    ) -> Vec<MotionEvent> {
        let mut events = Vec::new();
        self.try_place(oracle, cfg, &mut events);

        if !matches!(self.path_state, PathState::TraversingLink { .. }) {
            if let Some(path) = self.pending.take() {
                self.path_state = PathState::Following(path);
            }
        }

        let state = std::mem::replace(&mut self.path_state, PathState::Idle);
        self.path_state = match state {
            PathState::Idle => PathState::Idle,
            PathState::Following(path) => self.follow(path, dt, oracle, cfg, &mut events),
            PathState::TraversingLink {
                mut traversal,
                resume,
            } => match traversal.advance(dt, &mut self.transform) {
                TraversalStatus::InProgress => PathState::TraversingLink { traversal, resume },
                TraversalStatus::Done => self.complete_link(resume, &mut events),
            },
        };
        events
    }

    fn follow(
        &mut self,
        mut path: NavPath,
        dt: f32,
        oracle: &dyn NavigationOracle,
        cfg: &MotionConfig,
        events: &mut Vec<MotionEvent>,
    ) -> PathState {
        let step = match oracle.step_along_path(&mut path, self.transform.position, cfg.move_speed * dt)
        {
            Ok(step) => step,
            Err(e) => {
                warn!(participant = %self.id, error = %e, "Path step failed, holding position");
                return PathState::Following(path);
            }
        };

        let moved = step.position - self.transform.position;
        let heading = Vec3::new(moved.x, 0.0, moved.z);
        if heading.len_sq() > 1e-8 {
            self.transform.rotation = self
                .transform
                .rotation
                .rotate_towards(Quat::look_rotation(heading), cfg.turn_rate_deg * dt);
        }
        self.transform.position = step.position;

        if let Some(link) = step.link_entered {
            debug!(participant = %self.id, ?link, "Entered off-mesh link");
            self.is_off_mesh = true;
            events.push(MotionEvent::LinkEntered(link));
            return PathState::TraversingLink {
                traversal: LinkTraversal::new(link, cfg.into()),
                resume: path,
            };
        }

        let close_enough = !path.has_links()
            && self
                .destination
                .is_some_and(|d| d.distance(step.position) < cfg.arrival_radius);
        if step.reached_end || close_enough {
            self.arrive(events);
            return PathState::Idle;
        }
        PathState::Following(path)
    }

    fn complete_link(&mut self, resume: NavPath, events: &mut Vec<MotionEvent>) -> PathState {
        self.is_off_mesh = false;
        events.push(MotionEvent::LinkCompleted);
        debug!(participant = %self.id, position = ?self.transform.position, "Off-mesh link complete");

        if let Some(path) = self.pending.take() {
            return PathState::Following(path);
        }
        if resume.is_empty() {
            self.arrive(events);
            return PathState::Idle;
        }
        PathState::Following(resume)
    }

    fn arrive(&mut self, events: &mut Vec<MotionEvent>) {
        debug!(participant = %self.id, position = ?self.transform.position, "Destination reached");
        self.destination = None;
        events.push(MotionEvent::Arrived);
    }

    fn try_place(
        &mut self,
        oracle: &dyn NavigationOracle,
        cfg: &MotionConfig,
        events: &mut Vec<MotionEvent>,
    ) {
        let Placement::Pending { attempts_left } = self.placement else {
            return;
        };
        match oracle.sample_point(self.transform.position, cfg.placement_radius) {
            Ok(p) => {
                self.transform.position = p;
                self.placement = Placement::Placed;
                events.push(MotionEvent::Placed(p));
                info!(participant = %self.id, position = ?p, "Entity placed on navigable surface");
            }
            Err(e) if attempts_left > 1 => {
                debug!(participant = %self.id, error = %e, attempts_left, "Placement failed, retrying");
                self.placement = Placement::Pending {
                    attempts_left: attempts_left - 1,
                };
            }
            Err(e) => {
                error!(participant = %self.id, error = %e, "Failed to place entity on navigable surface");
                self.placement = Placement::Unplaced;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hotpotato_shared::navmesh::RegionNavMesh;

    const DT: f32 = 1.0 / 30.0;

    fn spawn(at: Vec3) -> (MotionController, RegionNavMesh, MotionConfig) {
        let cfg = MotionConfig::default();
        let mesh = RegionNavMesh::demo();
        let mut ctrl = MotionController::new(ParticipantId(1), at, &cfg);
        ctrl.tick(DT, &mesh, &cfg);
        (ctrl, mesh, cfg)
    }

    fn run_until_idle(ctrl: &mut MotionController, mesh: &RegionNavMesh, cfg: &MotionConfig) {
        for _ in 0..10_000 {
            ctrl.tick(DT, mesh, cfg);
            if *ctrl.path_state() == PathState::Idle && !ctrl.has_pending_path() {
                return;
            }
        }
        panic!("entity never became idle");
    }

    #[test]
    fn spawn_is_placed_on_surface() {
        let (ctrl, mesh, _) = spawn(Vec3::new(0.0, 3.0, 0.0));
        assert!(mesh.is_on_surface(ctrl.position()));
    }

    #[test]
    fn walks_to_destination_and_goes_idle() {
        let (mut ctrl, mesh, cfg) = spawn(Vec3::ZERO);
        let target = Vec3::new(5.0, 0.0, 0.0);
        assert_eq!(ctrl.set_destination(target, &mesh, &cfg).unwrap(), target);
        run_until_idle(&mut ctrl, &mesh, &cfg);
        assert!(ctrl.position().distance(target) < cfg.arrival_radius);
        assert_eq!(ctrl.destination(), None);
    }

    #[test]
    fn new_path_waits_for_tick_boundary() {
        let (mut ctrl, mesh, cfg) = spawn(Vec3::ZERO);
        ctrl.set_destination(Vec3::new(5.0, 0.0, 0.0), &mesh, &cfg)
            .unwrap();
        assert_eq!(*ctrl.path_state(), PathState::Idle);
        assert!(ctrl.has_pending_path());
        ctrl.tick(DT, &mesh, &cfg);
        assert_eq!(ctrl.path_state().name(), "following");
    }

    #[test]
    fn unreachable_destination_changes_nothing() {
        let (mut ctrl, mesh, cfg) = spawn(Vec3::ZERO);
        let before = ctrl.clone();
        let res = ctrl.set_destination(Vec3::new(200.0, 0.0, 200.0), &mesh, &cfg);
        assert!(matches!(res, Err(SessionError::NavigationUnresolvable(_))));
        assert_eq!(ctrl.transform(), before.transform());
        assert!(!ctrl.has_pending_path());
        assert_eq!(ctrl.destination(), None);
    }

    #[test]
    fn off_surface_entity_is_corrected_before_planning() {
        let cfg = MotionConfig {
            placement_attempts: 0,
            ..MotionConfig::default()
        };
        let mesh = RegionNavMesh::demo();
        let mut ctrl = MotionController::new(ParticipantId(1), Vec3::new(0.0, 0.0, 12.0), &cfg);
        ctrl.set_destination(Vec3::new(0.0, 0.0, 0.0), &mesh, &cfg)
            .unwrap();
        assert!(mesh.is_on_surface(ctrl.position()));
    }

    #[test]
    fn crossing_a_gap_traverses_link_and_lands_on_end() {
        let (mut ctrl, mesh, cfg) = spawn(Vec3::new(0.0, 0.0, 5.0));
        ctrl.set_destination(Vec3::new(0.0, 0.0, 20.0), &mesh, &cfg)
            .unwrap();

        let mut entered = None;
        for _ in 0..10_000 {
            let events = ctrl.tick(DT, &mesh, &cfg);
            if let Some(MotionEvent::LinkEntered(link)) = events.first() {
                entered = Some(*link);
                assert!(ctrl.is_off_mesh());
            }
            if events.contains(&MotionEvent::LinkCompleted) {
                let link = entered.expect("link entered before completing");
                assert_eq!(ctrl.position(), link.end);
                assert!(!ctrl.is_off_mesh());
                break;
            }
        }
        run_until_idle(&mut ctrl, &mesh, &cfg);
        assert!(ctrl.position().distance(Vec3::new(0.0, 0.0, 20.0)) < cfg.arrival_radius);
    }

    #[test]
    fn command_during_link_waits_for_link_to_finish() {
        let (mut ctrl, mesh, cfg) = spawn(Vec3::new(0.0, 0.0, 9.0));
        ctrl.set_destination(Vec3::new(0.0, 0.0, 20.0), &mesh, &cfg)
            .unwrap();
        while !ctrl.is_off_mesh() {
            ctrl.tick(DT, &mesh, &cfg);
        }
        let link_end = match ctrl.path_state() {
            PathState::TraversingLink { traversal, .. } => traversal.link().end,
            other => panic!("expected link traversal, got {other:?}"),
        };

        // Plans from the far side of the link.
        ctrl.set_destination(Vec3::new(5.0, 0.0, 20.0), &mesh, &cfg)
            .unwrap();
        ctrl.tick(DT, &mesh, &cfg);
        assert_eq!(ctrl.path_state().name(), "traversing_link");

        while ctrl.is_off_mesh() {
            ctrl.tick(DT, &mesh, &cfg);
        }
        assert_eq!(ctrl.position(), link_end);
        run_until_idle(&mut ctrl, &mesh, &cfg);
        assert!(ctrl.position().distance(Vec3::new(5.0, 0.0, 20.0)) < cfg.arrival_radius);
    }

    #[test]
    fn unplaceable_spawn_gives_up_after_attempts() {
        let cfg = MotionConfig::default();
        let mesh = RegionNavMesh::demo();
        let far = Vec3::new(500.0, 0.0, 500.0);
        let mut ctrl = MotionController::new(ParticipantId(1), far, &cfg);
        for _ in 0..cfg.placement_attempts + 2 {
            assert!(ctrl.tick(DT, &mesh, &cfg).is_empty());
        }
        assert_eq!(ctrl.position(), far);
        assert_eq!(ctrl.placement, Placement::Unplaced);
    }
}
