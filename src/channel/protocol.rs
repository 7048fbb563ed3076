//! Sync Channel Wire Protocol
//!
//! One JSON object per line in both directions. Proxy → backend messages carry
//! the logical change shape
//! `{type, sequenceNumber?, playerId?, capeId?: string|null, version?}`;
//! `capeId: null` is an explicit "no cape", distinct from an absent record.

use crate::error::{Result, SyncError};
use crate::model::types::{Assignment, CapeId, CapeState, ChangeEvent, NodeId, PlayerId};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Upper bound for a single encoded line.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Messages sent by the proxy to a backend node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMessage {
    /// A live change, in sequence order for this connection.
    #[serde(rename_all = "camelCase")]
    Change {
        sequence_number: u64,
        player_id: PlayerId,
        cape_id: Option<CapeId>,
        version: u64,
        updated_at: u64,
    },

    /// Opens a full snapshot taken at `sequence_number`.
    #[serde(rename_all = "camelCase")]
    ResyncStart {
        epoch: Uuid,
        sequence_number: u64,
        entries: usize,
    },

    #[serde(rename_all = "camelCase")]
    ResyncEntry {
        player_id: PlayerId,
        cape_id: Option<CapeId>,
        version: u64,
        updated_at: u64,
    },

    /// Closes the snapshot. The receiver continues tailing after `sequence_number`.
    #[serde(rename_all = "camelCase")]
    ResyncEnd { epoch: Uuid, sequence_number: u64 },

    /// The proxy could not produce a snapshot; try again later.
    #[serde(rename_all = "camelCase")]
    ResyncFailed { reason: String },

    #[serde(rename_all = "camelCase")]
    Pong { nonce: u64 },

    /// Answer to a forwarded `Assign` request.
    #[serde(rename_all = "camelCase")]
    AssignResult {
        request_id: u64,
        assignment: Option<Assignment>,
        error: Option<WireError>,
    },
}

impl SyncMessage {
    pub fn change(event: &ChangeEvent) -> Self {
        let a = &event.assignment;
        SyncMessage::Change {
            sequence_number: event.sequence,
            player_id: a.player,
            cape_id: a.cape.clone().into(),
            version: a.version,
            updated_at: a.updated_at,
        }
    }

    pub fn entry(assignment: &Assignment) -> Self {
        SyncMessage::ResyncEntry {
            player_id: assignment.player,
            cape_id: assignment.cape.clone().into(),
            version: assignment.version,
            updated_at: assignment.updated_at,
        }
    }

    /// The assignment carried by `Change` / `ResyncEntry`.
    pub fn assignment(&self) -> Option<Assignment> {
        match self {
            SyncMessage::Change {
                player_id,
                cape_id,
                version,
                updated_at,
                ..
            }
            | SyncMessage::ResyncEntry {
                player_id,
                cape_id,
                version,
                updated_at,
            } => Some(Assignment {
                player: *player_id,
                cape: CapeState::from(cape_id.clone()),
                version: *version,
                updated_at: *updated_at,
            }),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Change { .. } => "CHANGE",
            SyncMessage::ResyncStart { .. } => "RESYNC_START",
            SyncMessage::ResyncEntry { .. } => "RESYNC_ENTRY",
            SyncMessage::ResyncEnd { .. } => "RESYNC_END",
            SyncMessage::ResyncFailed { .. } => "RESYNC_FAILED",
            SyncMessage::Pong { .. } => "PONG",
            SyncMessage::AssignResult { .. } => "ASSIGN_RESULT",
        }
    }
}

/// Messages sent by a backend node to the proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncRequest {
    /// First message on every connection.
    #[serde(rename_all = "camelCase")]
    Hello { node_id: NodeId },

    /// Ask for a full snapshot.
    Resync,

    #[serde(rename_all = "camelCase")]
    Ping { nonce: u64 },

    /// A write forwarded from the backend to the authoritative proxy.
    #[serde(rename_all = "camelCase")]
    Assign {
        request_id: u64,
        player_id: PlayerId,
        cape_id: Option<CapeId>,
        expected_version: Option<u64>,
    },
}

/// Error shape shared by forwarded writes and the admin HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
}

impl From<&SyncError> for WireError {
    fn from(error: &SyncError) -> Self {
        let (expected, current) = match error {
            SyncError::Conflict {
                expected, current, ..
            } => (Some(*expected), Some(*current)),
            _ => (None, None),
        };
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
            expected,
            current,
        }
    }
}

impl WireError {
    /// Rebuilds the typed error on the receiving side.
    pub fn into_error(self, player: PlayerId) -> SyncError {
        match self.kind.as_str() {
            "conflict" => SyncError::Conflict {
                player,
                expected: self.expected.unwrap_or_default(),
                current: self.current.unwrap_or_default(),
            },
            "not_found" => SyncError::NotFound(player),
            "unknown_cape" => SyncError::UnknownCape(
                self.message
                    .trim_start_matches("unknown cape: ")
                    .to_string(),
            ),
            "store_unavailable" => SyncError::StoreUnavailable(self.message),
            "not_live" => SyncError::NotLive(self.message),
            _ => SyncError::TransportFailure(self.message),
        }
    }
}

pub fn encode_line<T: Serialize>(item: &T) -> Result<String> {
    Ok(serde_json::to_string(item)?)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line)?)
}
