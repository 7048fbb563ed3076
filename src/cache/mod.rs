//! Local Cache Module
//!
//! The read-optimized projection every node answers rendering queries from.
//! It is disposable: it can be dropped and rebuilt from the proxy at any time.
//!
//! Updates are last-writer-wins by assignment version, so duplicate or
//! reordered deliveries never move a player back to an older state.

pub mod local;
