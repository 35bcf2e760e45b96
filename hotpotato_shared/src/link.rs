//! Off-mesh link traversal.
//!
//! A traversal runs in two phases, advanced once per tick by its owner:
//!
//! 1. `Approach`: drift toward the link start while turning to face along the
//!    link. Ends once the heading is within `approach_threshold` (dot product)
//!    of the travel direction.
//! 2. `Traverse`: a fixed-duration interpolation from start to end. During the
//!    first `link_snap_fraction` seconds the position eases toward the
//!    interpolated goal, after that it tracks the goal directly.
//!
//! The authority drives a traversal on its entity, and observers replay an
//! equivalent one for visuals after being told a link was entered.

use serde::{Deserialize, Serialize};

use crate::{
    config::MotionConfig,
    math::{Quat, Transform},
    nav::OffMeshLinkData,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalStatus {
    InProgress,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LinkPhase {
    Approach,
    Traverse { remaining: f32 },
}

/// Constants a traversal needs, extracted from the motion config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkParams {
    pub turn_rate_deg: f32,
    pub approach_threshold: f32,
    pub duration: f32,
    pub snap_fraction: f32,
}

impl From<&MotionConfig> for LinkParams {
    fn from(cfg: &MotionConfig) -> Self {
        Self {
            turn_rate_deg: cfg.turn_rate_deg,
            approach_threshold: cfg.approach_threshold,
            duration: cfg.link_traverse_duration,
            snap_fraction: cfg.link_snap_fraction,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkTraversal {
    link: OffMeshLinkData,
    phase: LinkPhase,
    params: LinkParams,
}

impl LinkTraversal {
    pub fn new(link: OffMeshLinkData, params: LinkParams) -> Self {
        Self {
            link,
            phase: LinkPhase::Approach,
            params,
        }
    }

    pub fn link(&self) -> OffMeshLinkData {
        self.link
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    /// Advances the traversal by `dt` seconds, moving `transform`.
    ///
    /// The tick that finishes alignment also runs the first traverse step.
    /// On `Done` the position equals the link end exactly.
    pub fn advance(&mut self, dt: f32, transform: &mut Transform) -> TraversalStatus {
        if let LinkPhase::Approach = self.phase {
            if !self.approach(dt, transform) {
                return TraversalStatus::InProgress;
            }
            self.phase = LinkPhase::Traverse {
                remaining: self.params.duration,
            };
        }

        let LinkPhase::Traverse { remaining } = self.phase else {
            return TraversalStatus::InProgress;
        };

        let total = self.params.duration;
        let remaining = (remaining - dt).max(0.0);
        self.phase = LinkPhase::Traverse { remaining };

        if remaining <= 0.0 || total <= 0.0 {
            transform.position = self.link.end;
            return TraversalStatus::Done;
        }

        let goal = self.link.start.lerp(self.link.end, 1.0 - remaining / total);
        let elapsed = total - remaining;
        transform.position = if elapsed > self.params.snap_fraction || self.params.snap_fraction <= 0.0 {
            goal
        } else {
            transform
                .position
                .lerp(goal, elapsed / self.params.snap_fraction)
        };
        TraversalStatus::InProgress
    }

    /// One approach step. Returns true once aligned.
    fn approach(&self, dt: f32, transform: &mut Transform) -> bool {
        let dir = self.link.direction();
        transform.position = transform.position.lerp(self.link.start, dt);
        if dir.len_sq() == 0.0 {
            return true;
        }
        transform.rotation = transform
            .rotation
            .rotate_towards(Quat::look_rotation(dir), self.params.turn_rate_deg * dt);
        dir.dot(transform.rotation.forward()) > self.params.approach_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Vec3;

    fn params() -> LinkParams {
        LinkParams::from(&MotionConfig::default())
    }

    fn run(traversal: &mut LinkTraversal, transform: &mut Transform, dt: f32) -> usize {
        for tick in 1..10_000 {
            if traversal.advance(dt, transform) == TraversalStatus::Done {
                return tick;
            }
        }
        panic!("traversal never finished");
    }

    #[test]
    fn ends_exactly_at_link_end() {
        let link = OffMeshLinkData {
            start: Vec3::new(0.0, 0.0, 9.5),
            end: Vec3::new(0.0, 0.0, 14.5),
        };
        let mut t = LinkTraversal::new(link, params());
        // Facing away from the link so the approach phase takes a while.
        let mut transform = Transform {
            position: Vec3::new(0.5, 0.0, 9.0),
            rotation: Quat::look_rotation(Vec3::new(0.0, 0.0, -1.0)),
        };
        run(&mut t, &mut transform, 1.0 / 30.0);
        assert_eq!(transform.position, link.end);
    }

    #[test]
    fn aligned_entity_skips_straight_to_traverse() {
        let link = OffMeshLinkData {
            start: Vec3::ZERO,
            end: Vec3::new(0.0, 0.0, 4.0),
        };
        let mut t = LinkTraversal::new(link, params());
        let mut transform = Transform::at(Vec3::ZERO);
        assert_eq!(t.advance(0.1, &mut transform), TraversalStatus::InProgress);
        assert!(matches!(t.phase(), LinkPhase::Traverse { .. }));
    }

    #[test]
    fn traverse_takes_configured_duration() {
        let link = OffMeshLinkData {
            start: Vec3::ZERO,
            end: Vec3::new(0.0, 0.0, 4.0),
        };
        let mut t = LinkTraversal::new(link, params());
        let mut transform = Transform::at(Vec3::ZERO);
        // Already aligned: the first tick both aligns and traverses, so 0.7s
        // at 0.125s per tick finishes on the sixth tick.
        let ticks = run(&mut t, &mut transform, 0.125);
        assert_eq!(ticks, 6);
    }

    #[test]
    fn degenerate_link_completes() {
        let p = Vec3::new(1.0, 0.0, 1.0);
        let mut t = LinkTraversal::new(OffMeshLinkData { start: p, end: p }, params());
        let mut transform = Transform::at(Vec3::ZERO);
        run(&mut t, &mut transform, 0.05);
        assert_eq!(transform.position, p);
    }

    #[test]
    fn motion_eases_then_tracks_goal() {
        let link = OffMeshLinkData {
            start: Vec3::ZERO,
            end: Vec3::new(0.0, 0.0, 7.0),
        };
        let mut t = LinkTraversal::new(link, params());
        let mut transform = Transform::at(Vec3::ZERO);
        t.advance(0.1, &mut transform);
        // elapsed 0.1 of 0.7: goal z = 1.0, eased by 0.1 / 0.3.
        assert!((transform.position.z - 1.0 / 3.0).abs() < 1e-4);
        for _ in 0..3 {
            t.advance(0.1, &mut transform);
        }
        // elapsed 0.4 > 0.3: exactly on the goal.
        assert!((transform.position.z - 4.0).abs() < 1e-4);
    }
}
