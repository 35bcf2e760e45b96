//! Session error kinds.
//!
//! None of these end a session. Each is handled where it is detected:
//! logged, and the offending command or notification is dropped.

use thiserror::Error;

use crate::{nav::NavError, participant::ParticipantId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// A point or path could not be resolved on the navigable surface.
    #[error("navigation unresolvable: {0}")]
    NavigationUnresolvable(#[from] NavError),

    /// The target of a reliable message is no longer connected.
    #[error("participant {0} is not connected")]
    TargetDisconnected(ParticipantId),

    /// A token cycle found nobody to hand the token to.
    #[error("no connected participants")]
    EmptyParticipantSet,

    /// A privileged operation was requested by a non-authority.
    #[error("{operation} requires the authority role")]
    AuthorityPrecondition { operation: &'static str },

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub type SessionResult<T> = Result<T, SessionError>;
