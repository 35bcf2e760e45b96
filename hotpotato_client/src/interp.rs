//! Interpolation.
//!
//! The server sends discrete snapshots at tick boundaries.
//! The client renders at its own rate and chases the latest authoritative
//! transform exponentially: each frame closes `dt * follow_rate` of the
//! remaining gap. There is no extrapolation past the last target.

use hotpotato_shared::math::Transform;

/// Displayed transform chasing the last authoritative one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothedTransform {
    displayed: Transform,
    target: Transform,
}

impl SmoothedTransform {
    /// Starts at rest on `at`.
    pub fn new(at: Transform) -> Self {
        Self {
            displayed: at,
            target: at,
        }
    }

    pub fn displayed(&self) -> Transform {
        self.displayed
    }

    pub fn target(&self) -> Transform {
        self.target
    }

    pub fn set_target(&mut self, target: Transform) {
        self.target = target;
    }

    /// Moves the displayed transform toward the target and returns it.
    pub fn advance(&mut self, dt: f32, follow_rate: f32) -> Transform {
        let t = follow_alpha(dt, follow_rate);
        self.displayed = Transform {
            position: self.displayed.position.lerp(self.target.position, t),
            rotation: self.displayed.rotation.slerp(self.target.rotation, t),
        };
        self.displayed
    }
}

/// Fraction of the remaining gap closed in one frame.
pub fn follow_alpha(dt: f32, follow_rate: f32) -> f32 {
    (dt * follow_rate).clamp(0.0, 1.0)
}
