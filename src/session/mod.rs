//! Bridge-session management: colibri contract, relay mesh, types.

pub mod manager;
pub mod types;

pub use manager::{BridgeSessionManager, Offer};
