//! Math types.
//!
//! This module intentionally stays small and deterministic.
//! It avoids SIMD/unsafe and focuses on stable semantics.
//!
//! Conventions: y is up, a rotation's forward axis is +Z.

use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

/// 3D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };
    pub const UP: Self = Self::new(0.0, 1.0, 0.0);
    pub const FORWARD: Self = Self::new(0.0, 0.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn cross(self, rhs: Self) -> Self {
        Self::new(
            self.y * rhs.z - self.z * rhs.y,
            self.z * rhs.x - self.x * rhs.z,
            self.x * rhs.y - self.y * rhs.x,
        )
    }

    pub fn len_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn len(self) -> f32 {
        self.len_sq().sqrt()
    }

    pub fn distance(self, to: Self) -> f32 {
        (to - self).len()
    }

    /// Unit vector in the same direction, or zero for a (near) zero vector.
    pub fn normalize_or_zero(self) -> Self {
        let len = self.len();
        if len <= f32::EPSILON {
            Self::ZERO
        } else {
            self * (1.0 / len)
        }
    }

    /// Moves toward `to` by at most `max_delta`, never overshooting.
    pub fn move_towards(self, to: Self, max_delta: f32) -> Self {
        let delta = to - self;
        let dist = delta.len();
        if dist <= max_delta || dist <= f32::EPSILON {
            to
        } else {
            self + delta * (max_delta / dist)
        }
    }

    pub fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(
            self.x + (to.x - self.x) * t,
            self.y + (to.y - self.y) * t,
            self.z + (to.z - self.z) * t,
        )
    }
}

impl Add for Vec3 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Neg for Vec3 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

/// Unit quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    /// Rotation of `angle` radians around a unit `axis`.
    pub fn from_axis_angle(axis: Vec3, angle: f32) -> Self {
        let (s, c) = (angle * 0.5).sin_cos();
        Self {
            x: axis.x * s,
            y: axis.y * s,
            z: axis.z * s,
            w: c,
        }
    }

    /// Rotation whose forward axis points along `dir`.
    ///
    /// Uses the shortest arc from +Z; a zero `dir` yields identity.
    pub fn look_rotation(dir: Vec3) -> Self {
        let dir = dir.normalize_or_zero();
        if dir == Vec3::ZERO {
            return Self::IDENTITY;
        }
        let d = Vec3::FORWARD.dot(dir);
        if d >= 1.0 - 1e-6 {
            return Self::IDENTITY;
        }
        if d <= -1.0 + 1e-6 {
            return Self::from_axis_angle(Vec3::UP, std::f32::consts::PI);
        }
        let axis = Vec3::FORWARD.cross(dir).normalize_or_zero();
        Self::from_axis_angle(axis, d.clamp(-1.0, 1.0).acos())
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z + self.w * rhs.w
    }

    pub fn normalize(self) -> Self {
        let len = self.dot(self).sqrt();
        if len <= f32::EPSILON {
            return Self::IDENTITY;
        }
        let inv = 1.0 / len;
        Self {
            x: self.x * inv,
            y: self.y * inv,
            z: self.z * inv,
            w: self.w * inv,
        }
    }

    /// Rotates a vector.
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let q = Vec3::new(self.x, self.y, self.z);
        let t = q.cross(v) * 2.0;
        v + t * self.w + q.cross(t)
    }

    /// The +Z axis after rotation.
    pub fn forward(self) -> Vec3 {
        self.rotate(Vec3::FORWARD)
    }

    /// Angle between two rotations in degrees.
    pub fn angle_to(self, to: Self) -> f32 {
        let d = self.dot(to).abs().min(1.0);
        (2.0 * d.acos()).to_degrees()
    }

    /// Spherical interpolation, `t` clamped to `[0, 1]`.
    pub fn slerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        let mut to = to;
        let mut d = self.dot(to);
        if d < 0.0 {
            to = Self {
                x: -to.x,
                y: -to.y,
                z: -to.z,
                w: -to.w,
            };
            d = -d;
        }
        if d > 0.9995 {
            return Self {
                x: self.x + (to.x - self.x) * t,
                y: self.y + (to.y - self.y) * t,
                z: self.z + (to.z - self.z) * t,
                w: self.w + (to.w - self.w) * t,
            }
            .normalize();
        }
        let theta = d.acos();
        let sin_theta = theta.sin();
        let a = ((1.0 - t) * theta).sin() / sin_theta;
        let b = (t * theta).sin() / sin_theta;
        Self {
            x: self.x * a + to.x * b,
            y: self.y * a + to.y * b,
            z: self.z * a + to.z * b,
            w: self.w * a + to.w * b,
        }
        .normalize()
    }

    /// Rotates toward `to` by at most `max_degrees`.
    pub fn rotate_towards(self, to: Self, max_degrees: f32) -> Self {
        let angle = self.angle_to(to);
        if angle <= f32::EPSILON || max_degrees >= angle {
            return to;
        }
        self.slerp(to, max_degrees / angle)
    }
}

/// Position plus orientation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Transform {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }
}
