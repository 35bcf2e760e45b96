//! Token relay.
//!
//! Authority-only. Once armed, the relay waits a random interval drawn from
//! `[min_interval, max_interval]`, hands the token to a random connected
//! participant, and waits again. The owning loop polls it with the session
//! clock, so it runs on its own schedule regardless of the tick rate.
//!
//! Per transfer:
//! - the previous holder is told to hide its indicator (skipped if it left),
//! - the new holder is told to show its indicator,
//! - every connected participant learns the new holder.
//!
//! Notifications to participants that dropped are swallowed; a cycle always
//! completes and always reschedules.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use hotpotato_shared::{
    config::TokenConfig,
    error::SessionError,
    net::NetMsg,
    participant::{ParticipantId, ParticipantSet},
    transport::{send_reliable_to_all, Transport},
};

/// The authoritative token owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenState {
    pub holder: Option<ParticipantId>,
}

/// Due time of the next transfer, on the session clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySchedule {
    due: Option<Duration>,
}

impl RelaySchedule {
    pub fn is_armed(&self) -> bool {
        self.due.is_some()
    }

    pub fn due(&self) -> Option<Duration> {
        self.due
    }

    pub fn is_due(&self, now: Duration) -> bool {
        self.due.is_some_and(|due| now >= due)
    }

    pub fn reset(&mut self, now: Duration, wait: Duration) {
        self.due = Some(now + wait);
    }
}

/// Outcome of one successful transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub previous: Option<ParticipantId>,
    pub holder: ParticipantId,
}

#[derive(Debug, Clone)]
pub struct TokenRelay {
    cfg: TokenConfig,
    state: TokenState,
    schedule: RelaySchedule,
    cycles: u64,
}

impl TokenRelay {
    pub fn new(cfg: TokenConfig) -> Self {
        Self {
            cfg,
            state: TokenState::default(),
            schedule: RelaySchedule::default(),
            cycles: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.schedule.is_armed()
    }

    pub fn holder(&self) -> Option<ParticipantId> {
        self.state.holder
    }

    pub fn state(&self) -> TokenState {
        self.state
    }

    pub fn schedule(&self) -> RelaySchedule {
        self.schedule
    }

    /// Cycles run so far, including skipped ones.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Draws the wait before the next transfer.
    pub fn next_interval<R: Rng>(&self, rng: &mut R) -> Duration {
        let secs = rng.gen_range(self.cfg.min_interval..=self.cfg.max_interval);
        Duration::from_secs_f32(secs)
    }

    /// Starts the schedule. Returns false if it was already running.
    ///
    /// Only the session bootstrap calls this.
    pub(crate) fn arm<P, T, R>(
        &mut self,
        now: Duration,
        participants: &P,
        transport: &mut T,
        rng: &mut R,
    ) -> bool
    where
        P: ParticipantSet + ?Sized,
        T: Transport + ?Sized,
        R: Rng,
    {
        if self.schedule.is_armed() {
            return false;
        }
        if self.cfg.transfer_on_start {
            let _ = self.run_cycle(participants, transport, rng);
        }
        let wait = self.next_interval(rng);
        self.schedule.reset(now, wait);
        debug!(wait_secs = wait.as_secs_f32(), "Token relay armed");
        true
    }

    /// Runs a cycle if one is due, then reschedules.
    ///
    /// Returns `None` when nothing was due.
    pub fn poll<P, T, R>(
        &mut self,
        now: Duration,
        participants: &P,
        transport: &mut T,
        rng: &mut R,
    ) -> Option<Result<Transfer, SessionError>>
    where
        P: ParticipantSet + ?Sized,
        T: Transport + ?Sized,
        R: Rng,
    {
        if !self.schedule.is_due(now) {
            return None;
        }
        let result = self.run_cycle(participants, transport, rng);
        let wait = self.next_interval(rng);
        self.schedule.reset(now, wait);
        Some(result)
    }

    fn run_cycle<P, T, R>(
        &mut self,
        participants: &P,
        transport: &mut T,
        rng: &mut R,
    ) -> Result<Transfer, SessionError>
    where
        P: ParticipantSet + ?Sized,
        T: Transport + ?Sized,
        R: Rng,
    {
        self.cycles += 1;
        let result = self.transfer(participants, transport, rng);
        match &result {
            Ok(t) => info!(previous = ?t.previous, holder = %t.holder, cycle = self.cycles, "Token passed"),
            Err(e) => debug!(error = %e, cycle = self.cycles, "Token cycle skipped"),
        }
        result
    }

    /// Picks a new holder among `participants` and notifies everyone involved.
    pub fn transfer<P, T, R>(
        &mut self,
        participants: &P,
        transport: &mut T,
        rng: &mut R,
    ) -> Result<Transfer, SessionError>
    where
        P: ParticipantSet + ?Sized,
        T: Transport + ?Sized,
        R: Rng,
    {
        let candidates = participants.connected();
        if candidates.is_empty() {
            return Err(SessionError::EmptyParticipantSet);
        }
        let holder = candidates[rng.gen_range(0..candidates.len())];
        let previous = self.state.holder;

        if let Some(prev) = previous {
            if participants.contains(prev) {
                notify(transport, prev, false);
            } else {
                debug!(participant = %prev, "Previous holder left, nothing to clear");
            }
        }
        notify(transport, holder, true);
        self.state.holder = Some(holder);

        send_reliable_to_all(transport, candidates, &NetMsg::TokenHolder { holder });
        Ok(Transfer { previous, holder })
    }
}

fn notify<T: Transport + ?Sized>(transport: &mut T, to: ParticipantId, visible: bool) {
    if let Err(e) = transport.send_reliable(to, NetMsg::SetTokenVisible { visible }) {
        debug!(participant = %to, visible, error = %e, "Token notification dropped");
    }
}
