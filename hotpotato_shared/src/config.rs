//! Configuration system.
//!
//! Loads session configuration from JSON strings/files. Every field has a
//! default, so a config file only needs the values it changes. Binaries apply
//! command-line overrides on top and then call [`SessionConfig::validate`].

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Root configuration shared by client/server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Fixed simulation tick rate.
    pub tick_hz: u32,
    /// Navigation mesh file. The built-in demo arena is used when absent.
    pub navmesh: Option<String>,
    /// Start the token relay as soon as the server is up.
    pub autostart: bool,
    pub token: TokenConfig,
    pub motion: MotionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            tick_hz: 30,
            navmesh: None,
            autostart: false,
            token: TokenConfig::default(),
            motion: MotionConfig::default(),
        }
    }
}

/// Token relay schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Shortest wait between transfers, seconds.
    pub min_interval: f32,
    /// Longest wait between transfers, seconds.
    pub max_interval: f32,
    /// Hand the token out as soon as the relay starts instead of after the first wait.
    pub transfer_on_start: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            min_interval: 10.0,
            max_interval: 20.0,
            transfer_on_start: false,
        }
    }
}

/// Locomotion, link traversal and replica smoothing constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Walking speed, units per second.
    pub move_speed: f32,
    /// Turning speed, degrees per second.
    pub turn_rate_deg: f32,
    /// Distance at which the destination counts as reached.
    pub arrival_radius: f32,
    /// Heading alignment (dot product) that ends the link approach phase.
    pub approach_threshold: f32,
    /// Seconds spent crossing a link.
    pub link_traverse_duration: f32,
    /// Seconds at the start of a crossing during which motion eases in.
    pub link_snap_fraction: f32,
    /// Search radius for snapping entities and destinations onto the surface.
    pub correction_radius: f32,
    /// Search radius for resolving a picked point on the client.
    pub pick_radius: f32,
    /// Replica catch-up rate, per second.
    pub follow_rate: f32,
    /// Ticks spent trying to place a new entity on the surface.
    pub placement_attempts: u32,
    /// Search radius used while placing a new entity.
    pub placement_radius: f32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            move_speed: 3.5,
            turn_rate_deg: 180.0,
            arrival_radius: 0.5,
            approach_threshold: 0.8,
            link_traverse_duration: 0.7,
            link_snap_fraction: 0.3,
            correction_radius: 10.0,
            pick_radius: 5.0,
            follow_rate: 10.0,
            placement_attempts: 5,
            placement_radius: 10.0,
        }
    }
}

impl SessionConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Seconds per simulation tick.
    pub fn tick_dt(&self) -> f32 {
        1.0 / self.tick_hz.max(1) as f32
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.tick_hz == 0 {
            return Err(invalid("tick_hz must be positive"));
        }
        self.token.validate()?;
        self.motion.validate()
    }
}

impl TokenConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if !(positive(self.min_interval) && positive(self.max_interval)) {
            return Err(invalid("token intervals must be positive"));
        }
        if self.min_interval > self.max_interval {
            return Err(invalid("token.min_interval exceeds token.max_interval"));
        }
        Ok(())
    }
}

impl MotionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        let checks = [
            ("move_speed", self.move_speed),
            ("turn_rate_deg", self.turn_rate_deg),
            ("arrival_radius", self.arrival_radius),
            ("link_traverse_duration", self.link_traverse_duration),
            ("correction_radius", self.correction_radius),
            ("pick_radius", self.pick_radius),
            ("follow_rate", self.follow_rate),
            ("placement_radius", self.placement_radius),
        ];
        if let Some((name, _)) = checks.iter().find(|(_, v)| !positive(*v)) {
            return Err(SessionError::InvalidConfig(format!(
                "motion.{name} must be positive"
            )));
        }
        if !(self.approach_threshold > 0.0 && self.approach_threshold < 1.0) {
            return Err(invalid("motion.approach_threshold must lie in (0, 1)"));
        }
        if !(self.link_snap_fraction >= 0.0
            && self.link_snap_fraction <= self.link_traverse_duration)
        {
            return Err(invalid(
                "motion.link_snap_fraction must lie in [0, link_traverse_duration]",
            ));
        }
        Ok(())
    }
}

fn positive(v: f32) -> bool {
    v.is_finite() && v > 0.0
}

fn invalid(msg: &str) -> SessionError {
    SessionError::InvalidConfig(msg.to_string())
}
