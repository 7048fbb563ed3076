use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;

use super::protocol::{
    AssignRequest, ChangesQuery, ChangesResponse, ENDPOINT_ASSIGNMENT, ENDPOINT_ASSIGNMENTS,
    ENDPOINT_CAPES, ENDPOINT_CHANGES, ENDPOINT_HISTORY, ENDPOINT_NODES, NodesResponse,
};
use super::service::ProxyService;
use crate::channel::protocol::WireError;
use crate::error::SyncError;
use crate::model::catalog::CapeDefinition;
use crate::model::types::{Assignment, CapeState, PlayerId};

pub type ApiError = (StatusCode, Json<WireError>);

pub fn status_for(error: &SyncError) -> StatusCode {
    match error {
        SyncError::Conflict { .. } => StatusCode::CONFLICT,
        SyncError::NotFound(_) => StatusCode::NOT_FOUND,
        SyncError::UnknownCape(_) => StatusCode::BAD_REQUEST,
        SyncError::SequenceGap { .. } => StatusCode::GONE,
        SyncError::StoreUnavailable(_) | SyncError::NotLive(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn api_error(error: SyncError) -> ApiError {
    (status_for(&error), Json(WireError::from(&error)))
}

pub(crate) fn parse_player(raw: &str) -> Result<PlayerId, ApiError> {
    raw.parse().map_err(|e| {
        tracing::debug!("Rejected player id {:?}: {}", raw, e);
        (
            StatusCode::BAD_REQUEST,
            Json(WireError {
                kind: "bad_request".to_string(),
                message: format!("invalid player id: {}", raw),
                expected: None,
                current: None,
            }),
        )
    })
}

pub async fn handle_assign(
    Extension(service): Extension<Arc<ProxyService>>,
    Json(req): Json<AssignRequest>,
) -> Result<Json<Assignment>, ApiError> {
    service
        .set(
            req.player_id,
            CapeState::from(req.cape_id),
            req.expected_version,
        )
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn handle_get_assignment(
    Extension(service): Extension<Arc<ProxyService>>,
    Path(player): Path<String>,
) -> Result<Json<Assignment>, ApiError> {
    let player = parse_player(&player)?;
    service.get(&player).map(Json).map_err(api_error)
}

pub async fn handle_get_history(
    Extension(service): Extension<Arc<ProxyService>>,
    Path(player): Path<String>,
) -> Result<Json<Vec<Assignment>>, ApiError> {
    let player = parse_player(&player)?;
    service.history(&player).map(Json).map_err(api_error)
}

pub async fn handle_get_changes(
    Extension(service): Extension<Arc<ProxyService>>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<ChangesResponse>, ApiError> {
    let events = service.changes_from(query.from).map_err(api_error)?;
    Ok(Json(ChangesResponse {
        epoch: service.epoch(),
        head: service.head(),
        events,
    }))
}

pub async fn handle_list_capes(
    Extension(service): Extension<Arc<ProxyService>>,
) -> Json<Vec<CapeDefinition>> {
    Json(
        service
            .catalog()
            .list()
            .into_iter()
            .map(|definition| definition.as_ref().clone())
            .collect(),
    )
}

pub async fn handle_list_nodes(
    Extension(service): Extension<Arc<ProxyService>>,
) -> Json<NodesResponse> {
    Json(NodesResponse {
        epoch: service.epoch(),
        head: service.head(),
        nodes: service.hub().connected_nodes(),
    })
}

pub fn router(service: Arc<ProxyService>) -> Router {
    Router::new()
        .route(ENDPOINT_ASSIGNMENTS, post(handle_assign))
        .route(ENDPOINT_ASSIGNMENT, get(handle_get_assignment))
        .route(ENDPOINT_HISTORY, get(handle_get_history))
        .route(ENDPOINT_CHANGES, get(handle_get_changes))
        .route(ENDPOINT_CAPES, get(handle_list_capes))
        .route(ENDPOINT_NODES, get(handle_list_nodes))
        .layer(Extension(service))
}
