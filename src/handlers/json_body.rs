//! JSON request bodies that fail the way every other bad request does.

use axum::{
    Json,
    extract::{FromRequest, Request},
};
use serde::de::DeserializeOwned;

use crate::errors::{AppError, ErrorKind};

/// Drop-in for [`axum::Json`] on the way in. A missing content type, a
/// syntax error or a field of the wrong type all answer 400 instead of
/// axum's 415/422.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBody<T>(pub T);

impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => {
                let message = rejection.body_text();
                Err(AppError::with_source(ErrorKind::MalformedRequest, message, rejection))
            }
        }
    }
}
