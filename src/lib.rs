//! Cape Assignment Synchronization Library
//!
//! Keeps every backend server of a game network in agreement with the proxy
//! about which cape each player wears. The proxy owns the canonical records;
//! backends hold a read cache that converges on them while servers join,
//! leave and restart independently.
//!
//! ## Architecture Modules
//!
//! - **`model`**: player and cape identities, versioned assignments, change events
//!   and the cape catalog.
//! - **`store`**: the proxy's authoritative assignment store, its sequenced change
//!   log and the persistence interface.
//! - **`cache`**: the per-node read cache with last-writer-wins-by-version updates.
//! - **`channel`**: the wire protocol, TCP and in-process links, and the proxy's
//!   registry of connected backends.
//! - **`proxy`**: the single-writer commit path, backend sessions and the admin API.
//! - **`sync`**: the backend's reconciliation engine, connection agent and status API.

pub mod backoff;
pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod model;
pub mod proxy;
pub mod store;
pub mod sync;
