//! Admin HTTP Protocol
//!
//! Endpoints and DTOs of the proxy's administrative API. Error bodies reuse
//! the sync channel's `WireError` so a caller sees the same `kind` whether it
//! wrote over HTTP or through a backend.

use crate::channel::hub::NodeInfo;
use crate::model::types::{CapeId, ChangeEvent, PlayerId};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- API Endpoints ---

/// Grant, revoke or change a player's cape.
pub const ENDPOINT_ASSIGNMENTS: &str = "/assignments";
/// Current assignment of one player.
pub const ENDPOINT_ASSIGNMENT: &str = "/assignments/:player";
/// Retained versions of one player, oldest first.
pub const ENDPOINT_HISTORY: &str = "/assignments/:player/history";
/// Retained change events from `?from=N`.
pub const ENDPOINT_CHANGES: &str = "/changes";
pub const ENDPOINT_CAPES: &str = "/capes";
/// Connected backend nodes and their liveness.
pub const ENDPOINT_NODES: &str = "/nodes";

// --- Data Transfer Objects ---

/// `capeId: null` clears the player's cape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    pub player_id: PlayerId,
    pub cape_id: Option<CapeId>,
    /// Optimistic check; omit for an unconditional write.
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangesQuery {
    #[serde(default)]
    pub from: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesResponse {
    pub epoch: Uuid,
    pub head: u64,
    pub events: Vec<ChangeEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodesResponse {
    pub epoch: Uuid,
    pub head: u64,
    pub nodes: Vec<NodeInfo>,
}
