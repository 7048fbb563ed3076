//! Authoritative State Module
//!
//! Lives on the proxy. Owns the canonical player → cape records and the
//! sequenced log of changes that is broadcast to backend servers.
//!
//! ## Components
//! - **`memory`**: `AssignmentStore`, versioned records with optimistic concurrency.
//! - **`changelog`**: `ChangeLog`, gap-free sequence numbers and restartable readers.
//! - **`persistence`**: the blocking load/save interface and its file / memory backends.

pub mod changelog;
pub mod memory;
pub mod persistence;
