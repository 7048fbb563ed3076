//! Sync Channel Module
//!
//! Carries change events from the proxy to every backend server and the
//! backends' requests (resync, heartbeat, forwarded writes) back.
//!
//! ## Core Concepts
//! - **Wire Protocol**: newline-delimited JSON with a `type` tag on every message.
//! - **Links**: one `Link` abstraction with a TCP and an in-process binding. A link
//!   is order preserving; a closed link is the disconnect notification.
//! - **Hub**: the proxy's registry of connected nodes, each with a bounded outbound
//!   queue. Overflow drops the node instead of losing events silently.

pub mod hub;
pub mod protocol;
pub mod transport;
