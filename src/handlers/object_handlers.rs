//! HTTP handlers for object operations.
//! Content is streamed in both directions; the handlers only pick apart the
//! request and hand off to the services.

use crate::{
    errors::{AppError, ErrorKind},
    handlers::{caller::Caller, json_body::JsonBody},
    models::object::{
        ChangeTokenRequest, CreateObjectRequest, ObjectResponse, ObjectResultset, Paging,
        UpdateObjectRequest,
    },
    services::{
        download_service::{self, Disposition},
        object_service::{self, parse_id},
        upload_service,
    },
    state::AppState,
};
use axum::{
    Json,
    extract::{FromRequest, Multipart, Path, Query, Request, State},
    http::{HeaderMap, header},
    response::Response,
};
use serde::Deserialize;

/// Query params accepted by the stream endpoints.
#[derive(Debug, Deserialize, Default)]
pub struct StreamQuery {
    pub disposition: Option<String>,
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"))
}

/// `POST /objects`: multipart with content, or JSON for metadata only.
pub async fn create_object(
    State(state): State<AppState>,
    caller: Caller,
    request: Request,
) -> Result<Json<ObjectResponse>, AppError> {
    let response = if is_multipart(request.headers()) {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::MalformedRequest, "Unable to get mime multipart", e))?;
        upload_service::create_with_stream(&state, &caller.dn, multipart).await?
    } else {
        let JsonBody(req) = JsonBody::<CreateObjectRequest>::from_request(request, &state).await?;
        upload_service::create_metadata_only(&state, &caller.dn, req).await?
    };
    Ok(Json(response))
}

/// `GET /objects`
pub async fn list_roots(
    State(state): State<AppState>,
    caller: Caller,
    Query(paging): Query<Paging>,
) -> Result<Json<ObjectResultset>, AppError> {
    Ok(Json(object_service::list(&state, &caller.dn, None, paging).await?))
}

/// `GET /objects/{id}`
pub async fn list_children(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Query(paging): Query<Paging>,
) -> Result<Json<ObjectResultset>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(object_service::list(&state, &caller.dn, Some(id), paging).await?))
}

/// `GET /trash`
pub async fn list_trash(
    State(state): State<AppState>,
    caller: Caller,
    Query(paging): Query<Paging>,
) -> Result<Json<ObjectResultset>, AppError> {
    Ok(Json(object_service::list_trash(&state, &caller.dn, paging).await?))
}

/// `GET /objects/{id}/properties`
pub async fn get_properties(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<ObjectResponse>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(object_service::get_properties(&state, &caller.dn, id).await?))
}

/// `POST /objects/{id}/properties`
pub async fn update_properties(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<UpdateObjectRequest>,
) -> Result<Json<ObjectResponse>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(object_service::update_properties(&state, &caller.dn, id, req).await?))
}

/// `GET /objects/{id}/stream`
pub async fn get_stream(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let id = parse_id(&id)?;
    let disposition = Disposition::parse(query.disposition.as_deref());
    download_service::download_object(&state, &caller.dn, id, &headers, disposition).await
}

/// `POST /objects/{id}/stream`
pub async fn update_stream(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<Json<ObjectResponse>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(upload_service::update_stream(&state, &caller.dn, id, multipart).await?))
}

/// `POST /objects/{id}/trash`
pub async fn trash_object(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<ChangeTokenRequest>,
) -> Result<Json<ObjectResponse>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(object_service::trash(&state, &caller.dn, id, req).await?))
}

/// `POST /objects/{id}/untrash`
pub async fn untrash_object(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<ChangeTokenRequest>,
) -> Result<Json<ObjectResponse>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(object_service::untrash(&state, &caller.dn, id, req).await?))
}

/// `DELETE /objects/{id}`
pub async fn expunge_object(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<ChangeTokenRequest>,
) -> Result<Json<ObjectResponse>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(object_service::expunge(&state, &caller.dn, id, req).await?))
}

/// `POST /objects/{id}/move/{parent}`
pub async fn move_object(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, parent)): Path<(String, String)>,
    JsonBody(req): JsonBody<ChangeTokenRequest>,
) -> Result<Json<ObjectResponse>, AppError> {
    let id = parse_id(&id)?;
    let parent = parse_id(&parent)?;
    Ok(Json(object_service::move_object(&state, &caller.dn, id, parent, req).await?))
}
