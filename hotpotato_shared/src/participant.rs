//! Participants, roles, and the connectivity roster.

use std::{
    collections::BTreeSet,
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

use serde::{Deserialize, Serialize};

static NEXT_PARTICIPANT_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a connected participant. Also identifies the participant's avatar entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub u32);

impl ParticipantId {
    pub fn new_unique() -> Self {
        ParticipantId(NEXT_PARTICIPANT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Whether the local process may mutate shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Authority,
    Replica,
}

/// Read-only view of who is connected right now.
pub trait ParticipantSet {
    /// Connected participants in stable (ascending) order.
    fn connected(&self) -> Vec<ParticipantId>;

    fn contains(&self, id: ParticipantId) -> bool {
        self.connected().contains(&id)
    }

    fn is_empty(&self) -> bool {
        self.connected().is_empty()
    }
}

/// Connectivity roster maintained by the session on join/leave.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    members: BTreeSet<ParticipantId>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the participant was already present.
    pub fn join(&mut self, id: ParticipantId) -> bool {
        self.members.insert(id)
    }

    /// Returns false if the participant was not present.
    pub fn leave(&mut self, id: ParticipantId) -> bool {
        self.members.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.members.iter().copied()
    }
}

impl ParticipantSet for Roster {
    fn connected(&self) -> Vec<ParticipantId> {
        self.members.iter().copied().collect()
    }

    fn contains(&self, id: ParticipantId) -> bool {
        self.members.contains(&id)
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl FromIterator<ParticipantId> for Roster {
    fn from_iter<I: IntoIterator<Item = ParticipantId>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_tracks_join_and_leave_in_order() {
        let mut roster = Roster::new();
        assert!(roster.join(ParticipantId(3)));
        assert!(roster.join(ParticipantId(1)));
        assert!(!roster.join(ParticipantId(1)));
        assert_eq!(roster.connected(), vec![ParticipantId(1), ParticipantId(3)]);

        assert!(roster.leave(ParticipantId(3)));
        assert!(!roster.contains(ParticipantId(3)));
        assert!(!roster.leave(ParticipantId(3)));
    }

    #[test]
    fn unique_ids_increase() {
        let a = ParticipantId::new_unique();
        let b = ParticipantId::new_unique();
        assert!(b > a);
    }
}
