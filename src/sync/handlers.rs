use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::agent::{BackendNode, BackendStatus};
use crate::error::SyncError;
use crate::model::types::{CapeId, PlayerId};
use crate::proxy::handlers::{ApiError, api_error, parse_player};

pub const ENDPOINT_CACHE_ENTRY: &str = "/cache/:player";
pub const ENDPOINT_STATUS: &str = "/status";

/// What a backend currently believes about one player.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheView {
    pub player_id: PlayerId,
    /// `null` is an explicit "no cape".
    pub cape_id: Option<CapeId>,
    pub version: u64,
    pub fetched_at_version: u64,
    pub fetched_at_sequence: u64,
    pub stale: bool,
    pub degraded: bool,
}

pub async fn handle_get_cache_entry(
    Extension(node): Extension<Arc<BackendNode>>,
    Path(player): Path<String>,
) -> Result<Json<CacheView>, ApiError> {
    let player = parse_player(&player)?;
    let entry = node
        .cache()
        .lookup_entry(&player)
        .ok_or_else(|| api_error(SyncError::NotFound(player)))?;

    Ok(Json(CacheView {
        player_id: player,
        cape_id: entry.assignment.cape.cape_id().cloned(),
        version: entry.assignment.version,
        fetched_at_version: entry.fetched_at_version,
        fetched_at_sequence: entry.fetched_at_sequence,
        stale: entry.is_stale(),
        degraded: node.cache().is_degraded(),
    }))
}

pub async fn handle_get_status(
    Extension(node): Extension<Arc<BackendNode>>,
) -> (StatusCode, Json<BackendStatus>) {
    let status = node.status().await;
    // Still answers while degraded, but lets load balancers tell.
    let code = if status.engine.degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(status))
}

pub fn router(node: Arc<BackendNode>) -> Router {
    Router::new()
        .route(ENDPOINT_CACHE_ENTRY, get(handle_get_cache_entry))
        .route(ENDPOINT_STATUS, get(handle_get_status))
        .layer(Extension(node))
}
