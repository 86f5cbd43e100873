//! Replica configuration options.
//!
//! Field names are carried over from `original_source/options/options_base.hpp`
//! and `options/simple_options.hpp`, translated into a plain Rust struct
//! instead of the original's `option_names` string-constant namespace.

use std::time::Duration;

/// Tunable parameters of a running replica.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// How long the failure detector waits for the primary to move an
    /// outstanding request forward before suspecting it.
    pub fd_oper_timeout: Duration,
    /// Shorter, secondary timeout used to escalate a cascading failure
    /// (re-armed after `fd_oper_timeout` already fired once).
    pub fd_fail_timeout: Duration,
    /// Number of executed requests between checkpoints.
    pub checkpoint_interval: u32,
    /// Whether the audit observer is active.
    pub audit_enabled: bool,
    /// Bound on the number of commit/leader attestations the audit
    /// observer keeps in memory.
    pub audit_mem_size: usize,
    /// Bound on the number of recently-executed request hashes the
    /// failure detector retains, to recognize already-handled requests.
    pub max_completed_requests_memory: usize,
    /// Whether inbound envelopes are checked against the current peer set
    /// before being handed to the protocol layers.
    pub peer_validation_enabled: bool,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            fd_oper_timeout: Duration::from_secs(5),
            fd_fail_timeout: Duration::from_secs(2),
            checkpoint_interval: 1000,
            audit_enabled: true,
            audit_mem_size: 10_000,
            max_completed_requests_memory: 10_000,
            peer_validation_enabled: true,
        }
    }
}
