//! Input handling.
//!
//! Pointer picking lives outside this crate. Whatever point the player
//! clicks is snapped onto the local navmesh copy before a command is built,
//! so the server only ever sees walkable targets from well-behaved clients.

use tracing::warn;

use hotpotato_shared::{
    error::SessionError,
    math::Vec3,
    nav::NavigationOracle,
    net::NetMsg,
};

/// Snaps a picked point onto the walkable surface within `pick_radius`.
///
/// A pick nowhere near the surface is refused and nothing should be sent.
pub fn pick_destination(
    oracle: &dyn NavigationOracle,
    picked: Vec3,
    pick_radius: f32,
) -> Result<Vec3, SessionError> {
    match oracle.sample_point(picked, pick_radius) {
        Ok(point) => Ok(point),
        Err(e) => {
            warn!(?picked, error = %e, "Picked point is not walkable");
            Err(e.into())
        }
    }
}

/// The command sent for a snapped destination.
pub fn destination_command(point: Vec3) -> NetMsg {
    NetMsg::SetDestination { point }
}
