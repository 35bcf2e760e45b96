//! Region navigation mesh.
//!
//! Walkable space is a set of flat axis-aligned floor rectangles. Rectangles
//! are convex, so any two points on the same floor are joined by a straight
//! walk. Floors are connected only by off-mesh links, and routes between
//! floors are found with a breadth-first search over those links.
//!
//! Meshes are plain JSON so the server and clients can load the same file.

use std::{collections::VecDeque, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    math::Vec3,
    nav::{NavError, NavPath, NavigationOracle, OffMeshLinkData, PathStep, Waypoint},
};

/// Vertical slack when deciding whether a point stands on a floor.
const HEIGHT_TOLERANCE: f32 = 0.25;

/// A walkable rectangle at a fixed height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Floor {
    pub min_x: f32,
    pub max_x: f32,
    pub min_z: f32,
    pub max_z: f32,
    pub height: f32,
}

impl Floor {
    fn contains(&self, p: Vec3) -> bool {
        p.x >= self.min_x
            && p.x <= self.max_x
            && p.z >= self.min_z
            && p.z <= self.max_z
            && (p.y - self.height).abs() <= HEIGHT_TOLERANCE
    }

    fn closest_point(&self, p: Vec3) -> Vec3 {
        Vec3::new(
            p.x.clamp(self.min_x, self.max_x),
            self.height,
            p.z.clamp(self.min_z, self.max_z),
        )
    }
}

/// A link between two floors as authored in the mesh file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkDef {
    pub start: Vec3,
    pub end: Vec3,
    #[serde(default)]
    pub bidirectional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionNavMesh {
    pub floors: Vec<Floor>,
    #[serde(default)]
    pub links: Vec<LinkDef>,
    #[serde(default)]
    pub spawn_points: Vec<Vec3>,
}

impl RegionNavMesh {
    /// Loads a mesh from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read navmesh {}", path.display()))?;
        let mesh = Self::from_json_str(&text)
            .with_context(|| format!("parse navmesh {}", path.display()))?;
        info!(
            path = %path.display(),
            floors = mesh.floors.len(),
            links = mesh.links.len(),
            spawn_points = mesh.spawn_points.len(),
            "Navmesh loaded"
        );
        Ok(mesh)
    }

    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Built-in arena: a main floor, a far floor across a gap, and a raised
    /// ledge. Every floor is reachable through two-way links.
    pub fn demo() -> Self {
        Self {
            floors: vec![
                Floor {
                    min_x: -10.0,
                    max_x: 10.0,
                    min_z: -10.0,
                    max_z: 10.0,
                    height: 0.0,
                },
                Floor {
                    min_x: -10.0,
                    max_x: 10.0,
                    min_z: 14.0,
                    max_z: 30.0,
                    height: 0.0,
                },
                Floor {
                    min_x: 12.0,
                    max_x: 20.0,
                    min_z: -4.0,
                    max_z: 4.0,
                    height: 2.0,
                },
            ],
            links: vec![
                LinkDef {
                    start: Vec3::new(0.0, 0.0, 9.5),
                    end: Vec3::new(0.0, 0.0, 14.5),
                    bidirectional: true,
                },
                LinkDef {
                    start: Vec3::new(9.5, 0.0, 0.0),
                    end: Vec3::new(12.5, 2.0, 0.0),
                    bidirectional: true,
                },
            ],
            spawn_points: vec![
                Vec3::new(-4.0, 0.0, -4.0),
                Vec3::new(4.0, 0.0, -4.0),
                Vec3::new(-4.0, 0.0, 4.0),
                Vec3::new(4.0, 0.0, 4.0),
            ],
        }
    }

    fn floor_of(&self, p: Vec3) -> Option<usize> {
        self.floors.iter().position(|f| f.contains(p))
    }

    /// Directed link edges `(from_floor, to_floor, link)`.
    fn edges(&self) -> Vec<(usize, usize, OffMeshLinkData)> {
        let mut edges = Vec::new();
        for def in &self.links {
            let (Some(a), Some(b)) = (self.floor_of(def.start), self.floor_of(def.end)) else {
                continue;
            };
            edges.push((
                a,
                b,
                OffMeshLinkData {
                    start: def.start,
                    end: def.end,
                },
            ));
            if def.bidirectional {
                edges.push((
                    b,
                    a,
                    OffMeshLinkData {
                        start: def.end,
                        end: def.start,
                    },
                ));
            }
        }
        edges
    }

    /// Links to cross, in order, to get from floor `from` to floor `to`.
    fn route(&self, from: usize, to: usize) -> Option<Vec<OffMeshLinkData>> {
        let edges = self.edges();
        let mut came_from: Vec<Option<(usize, OffMeshLinkData)>> = vec![None; self.floors.len()];
        let mut visited = vec![false; self.floors.len()];
        let mut queue = VecDeque::from([from]);
        visited[from] = true;

        while let Some(floor) = queue.pop_front() {
            if floor == to {
                let mut links = Vec::new();
                let mut cur = to;
                while let Some((prev, link)) = came_from[cur] {
                    links.push(link);
                    cur = prev;
                }
                links.reverse();
                return Some(links);
            }
            for &(a, b, link) in edges.iter().filter(|(a, _, _)| *a == floor) {
                if !visited[b] {
                    visited[b] = true;
                    came_from[b] = Some((a, link));
                    queue.push_back(b);
                }
            }
        }
        None
    }
}

impl NavigationOracle for RegionNavMesh {
    fn sample_point(&self, point: Vec3, radius: f32) -> Result<Vec3, NavError> {
        self.floors
            .iter()
            .map(|f| f.closest_point(point))
            .map(|p| (p.distance(point), p))
            .filter(|(d, _)| *d <= radius)
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, p)| p)
            .ok_or(NavError::NoWalkablePoint { point, radius })
    }

    fn compute_path(&self, from: Vec3, to: Vec3) -> Result<NavPath, NavError> {
        let start = self
            .floor_of(from)
            .ok_or(NavError::OffSurface { position: from })?;
        let goal = self
            .floor_of(to)
            .ok_or(NavError::OffSurface { position: to })?;
        let links = self.route(start, goal).ok_or(NavError::NoPath { from, to })?;

        let waypoints = links
            .into_iter()
            .map(Waypoint::Link)
            .chain(std::iter::once(Waypoint::Walk(to)));
        Ok(NavPath::new(waypoints, to))
    }

    fn step_along_path(
        &self,
        path: &mut NavPath,
        position: Vec3,
        max_distance: f32,
    ) -> Result<PathStep, NavError> {
        if !(position.x.is_finite() && position.y.is_finite() && position.z.is_finite()) {
            return Err(NavError::OffSurface { position });
        }

        let mut pos = position;
        let mut budget = max_distance.max(0.0);
        loop {
            let Some(next) = path.front().copied() else {
                return Ok(PathStep {
                    position: pos,
                    link_entered: None,
                    reached_end: true,
                });
            };
            let target = match next {
                Waypoint::Walk(p) => p,
                Waypoint::Link(link) => link.start,
            };

            let dist = pos.distance(target);
            if dist > budget {
                return Ok(PathStep {
                    position: pos.move_towards(target, budget),
                    link_entered: None,
                    reached_end: false,
                });
            }

            pos = target;
            budget -= dist;
            path.pop_front();
            if let Waypoint::Link(link) = next {
                return Ok(PathStep {
                    position: pos,
                    link_entered: Some(link),
                    reached_end: false,
                });
            }
        }
    }
}
