//! Backend Synchronization Module
//!
//! Runs on every backend server. Keeps the local cache in step with the proxy
//! and exposes it to rendering code.
//!
//! ## Core Concepts
//! - **Reconciliation Engine**: a `Disconnected -> Resyncing -> Live` state machine
//!   that applies changes in sequence order, drops duplicates and turns gaps
//!   into a full resync.
//! - **Agent**: owns the connection to the proxy, reconnects with backoff, sends
//!   heartbeats and forwards admin writes.
//! - **Degraded Mode**: while not live, lookups keep answering from the last
//!   confirmed state and writes are refused.

pub mod agent;
pub mod engine;
pub mod handlers;
