use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    collections::BTreeMap,
    error::Error as StdError,
    fmt,
    panic::Location,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{error, info, warn};

use crate::{
    cache::{CacheError, drain::DrainError},
    crypto::{cipher::CipherError, keys::KeyError},
    models::marking::MarkingError,
    services::{aac::AacError, metadata_service::MetadataError, reconciler::ReconcileError},
};

/// What went wrong, independent of where.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Gone,
    DeletedState,
    Unauthorized,
    AuthorizationUnreachable,
    ChangeTokenMismatch,
    MalformedRequest,
    CipherFailure,
    BlobStoreFailure,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Gone => StatusCode::GONE,
            ErrorKind::DeletedState => StatusCode::METHOD_NOT_ALLOWED,
            ErrorKind::Unauthorized => StatusCode::FORBIDDEN,
            ErrorKind::AuthorizationUnreachable => StatusCode::BAD_GATEWAY,
            ErrorKind::ChangeTokenMismatch => StatusCode::PRECONDITION_REQUIRED,
            ErrorKind::MalformedRequest => StatusCode::BAD_REQUEST,
            ErrorKind::CipherFailure | ErrorKind::BlobStoreFailure | ErrorKind::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// An error on its way to becoming an HTTP response.
///
/// `message` is the only part the client sees. The source error and the
/// location that raised it are logged and counted by [`track_errors`].
#[derive(Debug)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: &'static Location<'static>,
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl AppError {
    #[track_caller]
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            location: Location::caller(),
            source: None,
        }
    }

    #[track_caller]
    pub fn with_source(
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: msg.into(),
            location: Location::caller(),
            source: Some(Box::new(source)),
        }
    }

    #[track_caller]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }

    #[track_caller]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    #[track_caller]
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedRequest, msg)
    }

    #[track_caller]
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, msg)
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Server-side details attached to an error response.
#[derive(Debug, Clone)]
pub struct ErrorDiagnostics {
    pub status: StatusCode,
    pub message: String,
    pub file: &'static str,
    pub line: u32,
    pub detail: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let diagnostics = ErrorDiagnostics {
            status,
            message: self.message.clone(),
            file: self.location.file(),
            line: self.location.line(),
            detail: self.source.as_ref().map(|e| e.to_string()),
        };

        let mut response = Response::new(Body::from(self.message));
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response.extensions_mut().insert(diagnostics);
        response
    }
}

/// Response counts keyed by (status, file, line).
#[derive(Debug, Default)]
pub struct ErrorCounters {
    counts: Mutex<BTreeMap<(u16, &'static str, u32), u64>>,
}

impl ErrorCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, diagnostics: &ErrorDiagnostics) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        *counts
            .entry((diagnostics.status.as_u16(), diagnostics.file, diagnostics.line))
            .or_insert(0) += 1;
    }

    pub fn count(&self, status: u16) -> u64 {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts
            .iter()
            .filter(|((s, _, _), _)| *s == status)
            .map(|(_, n)| n)
            .sum()
    }

    /// Plain text table, one line per site.
    pub fn render(&self) -> String {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::from("code\tcount\tsite\n");
        for ((status, file, line), n) in counts.iter() {
            out.push_str(&format!("{status}\t{n}\t{file}:{line}\n"));
        }
        out
    }
}

/// Middleware: log error responses with their diagnostics and count them.
pub async fn track_errors(
    State(counters): State<Arc<ErrorCounters>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let response = next.run(request).await;

    if let Some(diag) = response.extensions().get::<ErrorDiagnostics>() {
        counters.record(diag);
        let status = diag.status.as_u16();
        let detail = diag.detail.as_deref().unwrap_or("");
        if status < 400 {
            info!(status, %method, %uri, message = %diag.message, file = diag.file, line = diag.line, detail, "request failed");
        } else if status < 500 {
            warn!(status, %method, %uri, message = %diag.message, file = diag.file, line = diag.line, detail, "request failed");
        } else {
            error!(status, %method, %uri, message = %diag.message, file = diag.file, line = diag.line, detail, "request failed");
        }
    }

    response
}

impl From<anyhow::Error> for AppError {
    #[track_caller]
    fn from(err: anyhow::Error) -> Self {
        let err: Box<dyn StdError + Send + Sync> = err.into();
        Self {
            kind: ErrorKind::Internal,
            message: "internal server error".into(),
            location: Location::caller(),
            source: Some(err),
        }
    }
}

impl From<MetadataError> for AppError {
    #[track_caller]
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::ObjectNotFound(_) | MetadataError::RevisionNotFound { .. } => {
                let msg = err.to_string();
                AppError::with_source(ErrorKind::NotFound, msg, err)
            }
            MetadataError::ChangeTokenMismatch(_) => AppError::with_source(
                ErrorKind::ChangeTokenMismatch,
                "ChangeToken does not match expected value. Object may have been changed by another request.",
                err,
            ),
            other => AppError::with_source(ErrorKind::Internal, "metadata store error", other),
        }
    }
}

impl From<CipherError> for AppError {
    #[track_caller]
    fn from(err: CipherError) -> Self {
        AppError::with_source(ErrorKind::CipherFailure, "error transferring content", err)
    }
}

impl From<KeyError> for AppError {
    #[track_caller]
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::MacMismatch(_) => AppError::with_source(
                ErrorKind::Unauthorized,
                "Forbidden - permission failed integrity check",
                err,
            ),
            other => AppError::with_source(ErrorKind::Internal, "key handling error", other),
        }
    }
}

impl From<CacheError> for AppError {
    #[track_caller]
    fn from(err: CacheError) -> Self {
        AppError::with_source(ErrorKind::Internal, "cache error", err)
    }
}

impl From<DrainError> for AppError {
    #[track_caller]
    fn from(err: DrainError) -> Self {
        AppError::with_source(
            ErrorKind::BlobStoreFailure,
            "unable to retrieve content from storage",
            err,
        )
    }
}

impl From<AacError> for AppError {
    #[track_caller]
    fn from(err: AacError) -> Self {
        match err {
            AacError::Unreachable(_) => AppError::with_source(
                ErrorKind::AuthorizationUnreachable,
                "authorization service unavailable",
                err,
            ),
            AacError::InvalidMarking(_) | AacError::UserNotSpecified => {
                let msg = err.to_string();
                AppError::with_source(ErrorKind::MalformedRequest, msg, err)
            }
            AacError::Rejected(_) => AppError::with_source(
                ErrorKind::Unauthorized,
                "Forbidden - authorization service rejected the request",
                err,
            ),
        }
    }
}

impl From<ReconcileError> for AppError {
    #[track_caller]
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Marking(e) => AppError::from(e),
            ReconcileError::Key(e) => AppError::from(e),
            ReconcileError::Aac(e) => AppError::from(e),
            ReconcileError::OwnerLockedOut(_) => AppError::with_source(
                ErrorKind::Unauthorized,
                "Forbidden - the owner would no longer be able to read the object",
                err,
            ),
        }
    }
}

impl From<MarkingError> for AppError {
    #[track_caller]
    fn from(err: MarkingError) -> Self {
        let msg = format!("invalid acm: {err}");
        AppError::with_source(ErrorKind::MalformedRequest, msg, err)
    }
}
