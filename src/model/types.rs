use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable identity of a player across the whole network.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PlayerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Catalog key of a cape. Always lower-case, also when decoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(from = "String", into = "String")]
pub struct CapeId(String);

impl CapeId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CapeId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<CapeId> for String {
    fn from(value: CapeId) -> Self {
        value.0
    }
}

impl fmt::Display for CapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a player is wearing according to an assignment.
///
/// `NoCape` is an explicit revoke and must not be confused with a player that
/// was never assigned anything (that is the absence of an `Assignment`).
/// On the wire this is `capeId: "<id>"` or `capeId: null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<CapeId>", into = "Option<CapeId>")]
pub enum CapeState {
    Cape(CapeId),
    NoCape,
}

impl CapeState {
    pub fn cape(id: impl AsRef<str>) -> Self {
        CapeState::Cape(CapeId::new(id))
    }

    pub fn cape_id(&self) -> Option<&CapeId> {
        match self {
            CapeState::Cape(id) => Some(id),
            CapeState::NoCape => None,
        }
    }
}

impl From<Option<CapeId>> for CapeState {
    fn from(value: Option<CapeId>) -> Self {
        match value {
            Some(id) => CapeState::Cape(id),
            None => CapeState::NoCape,
        }
    }
}

impl From<CapeState> for Option<CapeId> {
    fn from(value: CapeState) -> Self {
        match value {
            CapeState::Cape(id) => Some(id),
            CapeState::NoCape => None,
        }
    }
}

/// One version of a player's cape assignment.
///
/// `version` is strictly increasing per player and is the only conflict
/// resolution key; `updated_at` is informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub player: PlayerId,
    pub cape: CapeState,
    pub version: u64,
    pub updated_at: u64,
}

/// An assignment snapshot stamped with its network-wide sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub sequence: u64,
    pub assignment: Assignment,
}

impl ChangeEvent {
    pub fn new(sequence: u64, assignment: Assignment) -> Self {
        Self {
            sequence,
            assignment,
        }
    }
}

/// Identifier a backend node announces when it connects to the proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
