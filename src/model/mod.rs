//! Data Model
//!
//! Identities, assignments and change events shared by every other subsystem,
//! plus the cape catalog assignments point into.
//!
//! - **`types`**: `PlayerId`, `CapeId`, `CapeState`, `Assignment`, `ChangeEvent`.
//! - **`catalog`**: immutable `CapeDefinition`s, replaced rather than mutated on edit.

pub mod catalog;
pub mod types;
