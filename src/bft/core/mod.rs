//! Core server-facing types shared by the consensus, log and
//! checkpoint/state-transfer layers.

pub mod server;
