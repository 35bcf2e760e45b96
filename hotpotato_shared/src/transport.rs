//! Transport abstraction.
//!
//! The simulation core is synchronous and never touches sockets. It hands
//! outgoing messages to a [`Transport`], and the owning loop moves them onto
//! the wire (or, in tests, straight into replicas).
//!
//! Reliable sends go to one participant and fail with
//! `SessionError::TargetDisconnected` when that participant is gone.
//! Callers swallow that error. Broadcasts are best-effort and never fail.

use std::collections::BTreeSet;

use crate::{
    error::SessionError,
    net::NetMsg,
    participant::{ParticipantId, ParticipantSet},
};

pub trait Transport {
    /// Ordered, eventually-delivered message to one connected participant.
    fn send_reliable(&mut self, to: ParticipantId, msg: NetMsg) -> Result<(), SessionError>;

    /// Unordered, lossy message to every connected participant.
    fn broadcast(&mut self, msg: NetMsg);
}

/// Sends `msg` reliably to every target, skipping ones that dropped.
///
/// Returns how many targets accepted the message.
pub fn send_reliable_to_all<T, I>(transport: &mut T, targets: I, msg: &NetMsg) -> usize
where
    T: Transport + ?Sized,
    I: IntoIterator<Item = ParticipantId>,
{
    targets
        .into_iter()
        .filter(|&to| transport.send_reliable(to, msg.clone()).is_ok())
        .count()
}

/// Queued output of one tick, drained by the owning loop.
#[derive(Debug, Default)]
pub struct Outbox {
    reachable: BTreeSet<ParticipantId>,
    reliable: Vec<(ParticipantId, NetMsg)>,
    broadcast: Vec<NetMsg>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts accepting reliable messages for `id`.
    pub fn connect(&mut self, id: ParticipantId) {
        self.reachable.insert(id);
    }

    /// Stops accepting messages for `id` and discards anything still queued for it.
    pub fn disconnect(&mut self, id: ParticipantId) {
        self.reachable.remove(&id);
        self.reliable.retain(|(to, _)| *to != id);
    }

    pub fn is_empty(&self) -> bool {
        self.reliable.is_empty() && self.broadcast.is_empty()
    }

    pub fn drain_reliable(&mut self) -> Vec<(ParticipantId, NetMsg)> {
        std::mem::take(&mut self.reliable)
    }

    pub fn drain_broadcast(&mut self) -> Vec<NetMsg> {
        std::mem::take(&mut self.broadcast)
    }

    /// Queued reliable messages, oldest first.
    pub fn pending_reliable(&self) -> &[(ParticipantId, NetMsg)] {
        &self.reliable
    }
}

impl Transport for Outbox {
    fn send_reliable(&mut self, to: ParticipantId, msg: NetMsg) -> Result<(), SessionError> {
        if !self.reachable.contains(&to) {
            return Err(SessionError::TargetDisconnected(to));
        }
        self.reliable.push((to, msg));
        Ok(())
    }

    fn broadcast(&mut self, msg: NetMsg) {
        self.broadcast.push(msg);
    }
}

impl ParticipantSet for Outbox {
    fn connected(&self) -> Vec<ParticipantId> {
        self.reachable.iter().copied().collect()
    }

    fn contains(&self, id: ParticipantId) -> bool {
        self.reachable.contains(&id)
    }
}
