//! `bafomet` implements a replicated key-value store driven by a PBFT
//! state machine replication core.
//!
//! The protocol internals live under [`bft`]; they are hidden from the
//! public API unless the `expose_impl` feature is enabled, mirroring how
//! the crate separates "library plumbing" from the swarm's public surface.

#[cfg(feature = "expose_impl")]
pub mod bft;

#[cfg(not(feature = "expose_impl"))]
mod bft;

pub use crate::bft::communication::NodeId;
pub use crate::bft::config::ReplicaConfig;
pub use crate::bft::error::{Error, ErrorKind, Result};
pub use crate::bft::executable::Service;
pub use crate::bft::{init, InitConfig, InitGuard};
