//! `hotpotato_server`
//!
//! Server-side systems:
//! - Entity motion with off-mesh link traversal (`motion`)
//! - Randomized token relay (`relay`) behind a one-shot start gate (`bootstrap`)
//! - Synchronous authority core (`session`)
//! - Fixed timestep socket loop (`server`)
//!
//! Networking model:
//! - TCP: handshake, commands and notifications
//! - UDP: snapshots

pub mod bootstrap;
pub mod motion;
pub mod relay;
pub mod server;
pub mod session;

pub use server::GameServer;
pub use session::AuthoritySession;
