//! `hotpotato_client`
//!
//! Client-side systems:
//! - Connection management (reliable + unreliable channels)
//! - Destination command building from picked points
//! - Replica world: snapshot interpolation, link replay, token mirror

pub mod client;
pub mod input;
pub mod interp;
pub mod replica;

pub use client::GameClient;
pub use replica::ReplicaWorld;
