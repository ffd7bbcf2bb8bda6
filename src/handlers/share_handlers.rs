//! HTTP handlers for grants and object history.

use crate::{
    errors::AppError,
    handlers::{caller::Caller, json_body::JsonBody, object_handlers::StreamQuery},
    models::{
        object::{ObjectResponse, Paging},
        permission::ObjectShareRequest,
        revision::RevisionResultset,
    },
    services::{
        download_service::{self, Disposition},
        object_service::{self, parse_id},
        share_service,
    },
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Response,
};

/// `POST /shared/{id}`
pub async fn add_share(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<ObjectShareRequest>,
) -> Result<Json<ObjectResponse>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(share_service::add_share(&state, &caller.dn, id, req).await?))
}

/// `DELETE /shared/{id}`
pub async fn remove_share(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<ObjectShareRequest>,
) -> Result<Json<ObjectResponse>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(share_service::remove_share(&state, &caller.dn, id, req).await?))
}

/// `GET /revisions/{id}`
pub async fn list_revisions(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Query(paging): Query<Paging>,
) -> Result<Json<RevisionResultset>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(object_service::list_revisions(&state, &caller.dn, id, paging).await?))
}

/// `GET /revisions/{id}/{rev}/stream`
pub async fn get_revision_stream(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, rev)): Path<(String, String)>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let id = parse_id(&id)?;
    let change_count: i64 = rev
        .parse()
        .map_err(|_| AppError::malformed(format!("invalid revision `{rev}`")))?;
    let disposition = Disposition::parse(query.disposition.as_deref());
    download_service::download_revision(&state, &caller.dn, id, change_count, &headers, disposition).await
}
