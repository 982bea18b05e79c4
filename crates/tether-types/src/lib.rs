//! Core types for Tether: live object sharing between two peers.
//!
//! This crate defines the data structures used across the Tether workspace:
//! object handles, the tagged wire-value vocabulary, the error taxonomy and
//! configuration. It contains no async code and no business logic.

pub mod config;
pub mod error;
pub mod handle;
pub mod wire;

pub use config::TetherConfig;
pub use error::{ErrorKind, RpcError, TetherError, TetherResult};
pub use handle::{Handle, ObjectId, SpawnId};
pub use wire::WireTag;
