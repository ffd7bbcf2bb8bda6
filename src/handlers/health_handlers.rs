//! Health, readiness and statistics handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the metadata store and cache disk
//! - GET /stats    -> plain-text counters for operators

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Cheap liveness probe; never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Pings SQLite.
/// 2. Performs a write/read/delete in the cache directory.
///
/// HTTP 200 when all checks pass, 503 when any fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite_check = match state.metadata.ping().await {
        Ok(()) => (true, None::<String>),
        Err(e) => (false, Some(format!("error: {e}"))),
    };

    let tmp_path = state
        .drain
        .cache()
        .root()
        .join(format!(".readyz-{}", Uuid::new_v4()));
    let disk_check = match fs::write(&tmp_path, b"readyz").await {
        Ok(_) => match fs::read(&tmp_path).await {
            Ok(bytes) => {
                let removed = fs::remove_file(&tmp_path).await;
                if bytes != b"readyz" {
                    (false, Some("file content mismatch".to_string()))
                } else if let Err(e) = removed {
                    (true, Some(format!("could not remove tmp file: {e}")))
                } else {
                    (true, None)
                }
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                (false, Some(format!("could not read tmp file: {e}")))
            }
        },
        Err(e) => (false, Some(format!("could not write tmp file: {e}"))),
    };

    let overall_ok = sqlite_check.0 && disk_check.0;
    let mut checks = HashMap::new();
    checks.insert(
        "sqlite",
        CheckStatus {
            ok: sqlite_check.0,
            error: sqlite_check.1,
        },
    );
    checks.insert(
        "cache",
        CheckStatus {
            ok: disk_check.0,
            error: disk_check.1,
        },
    );

    let body = ReadyResponse {
        status: if overall_ok { "ok".into() } else { "error".into() },
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// `GET /stats`
///
/// Error sites, job timings, the last eviction walk and cache backlog as
/// tab-separated sections.
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let mut out = String::new();
    out.push_str("# errors\n");
    out.push_str(&state.errors.render());

    out.push_str("\n# performance\n");
    out.push_str(&state.perf.report().await.render());

    out.push_str("\n# eviction\n");
    match state.evictor.last_stats() {
        Some(stats) => out.push_str(&stats.render()),
        None => out.push_str("no walk yet\n"),
    }

    out.push_str("\n# cache\n");
    match state.drain.count_uploaded().await {
        Ok(n) => {
            let _ = writeln!(out, "undrained\t{n}");
        }
        Err(e) => {
            let _ = writeln!(out, "undrained\terror: {e}");
        }
    }
    let _ = writeln!(out, "snippet_cache_users\t{}", state.aac.snippet_cache().len());

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        out,
    )
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
