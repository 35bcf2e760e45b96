//! Session bootstrap gate.
//!
//! The token relay starts at most once per session, and only at the
//! authority's request. Anyone else asking is a protocol violation.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use hotpotato_shared::{
    error::SessionError,
    participant::{ParticipantSet, Role},
    transport::Transport,
};

use crate::relay::TokenRelay;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionBootstrap {
    started: bool,
}

impl SessionBootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Starts the relay loop.
    ///
    /// Returns `Ok(true)` on the first authority call and `Ok(false)` on any
    /// later one. A replica caller gets `AuthorityPrecondition` and nothing
    /// changes.
    pub fn start_relay<P, T, R>(
        &mut self,
        role: Role,
        now: Duration,
        relay: &mut TokenRelay,
        participants: &P,
        transport: &mut T,
        rng: &mut R,
    ) -> Result<bool, SessionError>
    where
        P: ParticipantSet + ?Sized,
        T: Transport + ?Sized,
        R: Rng,
    {
        if role != Role::Authority {
            warn!(?role, "Protocol violation: start_relay requested by non-authority");
            return Err(SessionError::AuthorityPrecondition {
                operation: "start_relay",
            });
        }
        if self.started {
            debug!("Token relay already started");
            return Ok(false);
        }
        self.started = relay.arm(now, participants, transport, rng);
        info!(due = ?relay.schedule().due(), "Token relay started");
        Ok(self.started)
    }
}
