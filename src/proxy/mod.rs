//! Proxy Module
//!
//! The authoritative node. Owns the assignment store and the change log, commits
//! every write and serves backend sessions over the sync channel.
//!
//! ## Core Concepts
//! - **Single Writer**: one lock orders commits, broadcasts and resync snapshots.
//! - **Sessions**: a backend introduces itself with `HELLO`, then receives live
//!   changes and may ask for snapshots, heartbeats and forwarded writes.
//! - **Epochs**: a random id per proxy start lets backends notice a restart.
//! - **Admin API**: HTTP endpoints for writes, reads, history and node status.

pub mod handlers;
pub mod protocol;
pub mod service;

#[cfg(test)]
mod tests;
