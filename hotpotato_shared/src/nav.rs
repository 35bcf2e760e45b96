//! Navigation oracle contract.
//!
//! The simulation never inspects walkable geometry itself. It asks an oracle
//! to snap points onto the surface, to plan paths, and to step along them.
//! `crate::navmesh::RegionNavMesh` is the implementation shipped with the
//! workspace; tests are free to provide their own.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::math::Vec3;

/// A surface discontinuity crossed by a scripted traversal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OffMeshLinkData {
    pub start: Vec3,
    pub end: Vec3,
}

impl OffMeshLinkData {
    /// Unit travel direction; zero for a degenerate link.
    pub fn direction(&self) -> Vec3 {
        (self.end - self.start).normalize_or_zero()
    }
}

/// One leg of a path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Waypoint {
    /// Walk in a straight line to the point.
    Walk(Vec3),
    /// Walk to `link.start`, then hand over to the link traversal.
    Link(OffMeshLinkData),
}

/// A planned route. Consumed from the front as the entity advances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavPath {
    waypoints: VecDeque<Waypoint>,
    destination: Vec3,
}

impl NavPath {
    pub fn new(waypoints: impl IntoIterator<Item = Waypoint>, destination: Vec3) -> Self {
        Self {
            waypoints: waypoints.into_iter().collect(),
            destination,
        }
    }

    /// Straight walk to `to`.
    pub fn direct(to: Vec3) -> Self {
        Self::new([Waypoint::Walk(to)], to)
    }

    pub fn destination(&self) -> Vec3 {
        self.destination
    }

    pub fn front(&self) -> Option<&Waypoint> {
        self.waypoints.front()
    }

    pub fn pop_front(&mut self) -> Option<Waypoint> {
        self.waypoints.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn has_links(&self) -> bool {
        self.waypoints
            .iter()
            .any(|w| matches!(w, Waypoint::Link(_)))
    }
}

/// Result of one stepping call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathStep {
    pub position: Vec3,
    /// Set when the step arrived at the start of an off-mesh link.
    pub link_entered: Option<OffMeshLinkData>,
    pub reached_end: bool,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NavError {
    #[error("no walkable point within {radius} of {point:?}")]
    NoWalkablePoint { point: Vec3, radius: f32 },

    #[error("no path from {from:?} to {to:?}")]
    NoPath { from: Vec3, to: Vec3 },

    #[error("position {position:?} is off the navigable surface")]
    OffSurface { position: Vec3 },
}

/// Pathfinding capability consumed by the simulation.
pub trait NavigationOracle: Send + Sync {
    /// Nearest walkable point within `radius` of `point`.
    fn sample_point(&self, point: Vec3, radius: f32) -> Result<Vec3, NavError>;

    /// Plans a route between two walkable points.
    fn compute_path(&self, from: Vec3, to: Vec3) -> Result<NavPath, NavError>;

    /// Advances `position` along `path` by at most `max_distance`.
    ///
    /// Consumed waypoints are removed from `path`. The returned position is
    /// never further than `max_distance` from `position`.
    fn step_along_path(
        &self,
        path: &mut NavPath,
        position: Vec3,
        max_distance: f32,
    ) -> Result<PathStep, NavError>;

    /// Whether `point` already lies on the surface.
    fn is_on_surface(&self, point: Vec3) -> bool {
        self.sample_point(point, 1e-3)
            .map(|p| p.distance(point) <= 1e-3)
            .unwrap_or(false)
    }
}
