//! `hotpotato_shared`
//!
//! Shared libraries used by both client and server.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - Clear separation of concerns (math, navigation, link traversal, net, transport).
//! - Traits for abstraction and dependency injection (navigation oracle,
//!   participant set, transport).
//! - No `unsafe`.

pub mod config;
pub mod error;
pub mod link;
pub mod math;
pub mod nav;
pub mod navmesh;
pub mod net;
pub mod participant;
pub mod transport;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::link::*;
    pub use crate::math::*;
    pub use crate::nav::*;
    pub use crate::navmesh::*;
    pub use crate::net::*;
    pub use crate::participant::*;
    pub use crate::transport::*;
}
