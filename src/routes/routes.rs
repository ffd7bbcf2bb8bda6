//! Route definitions for the object drive API.
//!
//! Object ids in paths are 32 hex characters; handlers reject anything else
//! with 400.

use crate::{
    errors::track_errors,
    handlers::{
        health_handlers::{healthz, readyz, stats},
        object_handlers::{
            create_object, expunge_object, get_properties, get_stream, list_children, list_roots,
            list_trash, move_object, trash_object, untrash_object, update_properties, update_stream,
        },
        share_handlers::{add_share, get_revision_stream, list_revisions, remove_share},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};

/// Cap on JSON request bodies.
pub const JSON_BODY_LIMIT: usize = 5 * 1024 * 1024;

/// Build the router for every endpoint, with error tracking applied.
///
/// Uploads are streamed to disk, so only the two multipart routes lift the
/// body limit. Everything else is held to [`JSON_BODY_LIMIT`].
pub fn routes(state: AppState) -> Router {
    let errors = state.errors.clone();
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/stats", get(stats))
        // objects
        .route(
            "/objects",
            post(create_object).layer(DefaultBodyLimit::disable()).get(list_roots),
        )
        .route("/objects/{id}", get(list_children).delete(expunge_object))
        .route("/objects/{id}/properties", get(get_properties).post(update_properties))
        .route(
            "/objects/{id}/stream",
            post(update_stream).layer(DefaultBodyLimit::disable()).get(get_stream),
        )
        .route("/objects/{id}/trash", post(trash_object))
        .route("/objects/{id}/untrash", post(untrash_object))
        .route("/objects/{id}/move/{parent}", post(move_object))
        .route("/trash", get(list_trash))
        // grants and history
        .route("/shared/{id}", post(add_share).delete(remove_share))
        .route("/revisions/{id}", get(list_revisions))
        .route("/revisions/{id}/{rev}/stream", get(get_revision_stream))
        .layer(DefaultBodyLimit::max(JSON_BODY_LIMIT))
        .layer(middleware::from_fn_with_state(errors, track_errors))
        .with_state(state)
}
