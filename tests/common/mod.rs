//! Shared fixture: the full router over a temp SQLite file, a temp cache
//! directory, an in-memory blob store and the built-in authorization service.

#![allow(dead_code)]

use axum::{
    Router,
    body::{Body, Bytes},
    http::{HeaderMap, Request, StatusCode, header},
};
use object_drive::{
    cache::{
        blobstore::{OpendalBlobStore, memory_operator},
        drain::{DrainProvider, DrainSettings},
        eviction::{CacheEvictor, EvictionSettings, StatvfsUsage},
        fs::CacheFs,
    },
    crypto::keys::MasterKey,
    errors::ErrorCounters,
    routes::routes::routes,
    services::{
        aac::{AuthorizationGateway, StandaloneAac},
        metadata_service::{MetadataService, open_pool},
        performance::PerformanceHandle,
    },
    state::AppState,
};
use serde_json::Value;
use sqlx::sqlite::SqliteConnectOptions;
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;
use tower::ServiceExt;

pub const TESTER1: &str = "CN=test tester01,OU=People,OU=DAE,OU=chimera,O=U.S. Government,C=US";
pub const TESTER2: &str = "CN=test tester02,OU=People,OU=DAE,OU=chimera,O=U.S. Government,C=US";
pub const TESTER10: &str = "CN=test tester10,OU=People,OU=DAE,OU=chimera,O=U.S. Government,C=US";

pub const PAYLOAD: &[u8; 64] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@";

const BOUNDARY: &str = "drive-test-boundary";

pub struct Harness {
    pub app: Router,
    pub state: AppState,
    dir: TempDir,
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Reply {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or_else(|e| {
            panic!(
                "status {} body {:?} is not json: {e}",
                self.status,
                String::from_utf8_lossy(&self.body)
            )
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

fn fast_drain() -> DrainSettings {
    DrainSettings {
        workers: 2,
        push_attempts: 3,
        push_backoff: Duration::from_millis(5),
        pull_attempts: 22,
        pull_unit: Duration::from_millis(5),
        pull_budget: Duration::from_millis(500),
        stall_initial: Duration::from_millis(5),
        stall_max: Duration::from_millis(40),
        sweep_interval: Duration::from_secs(60),
    }
}

impl Harness {
    pub async fn new(aac: StandaloneAac) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let options = SqliteConnectOptions::new().filename(dir.path().join("drive.db"));
        let metadata = MetadataService::new(Arc::new(open_pool(options, 5).await.unwrap()));
        metadata.migrate().await.unwrap();

        let cache = CacheFs::open(dir.path().join("cache")).await.unwrap();
        let store = Arc::new(OpendalBlobStore::new(memory_operator().unwrap(), "memory"));
        let (perf, _task) = PerformanceHandle::spawn();
        let drain = DrainProvider::new(cache.clone(), store, fast_drain(), perf.clone());
        let evictor = Arc::new(CacheEvictor::new(
            cache,
            Arc::new(StatvfsUsage),
            EvictionSettings::default(),
        ));
        let aac = Arc::new(AuthorizationGateway::new(Arc::new(aac), true, perf.clone()));

        let state = AppState {
            metadata,
            drain,
            aac,
            master: Arc::new(MasterKey::new("otterpaws").unwrap()),
            perf,
            errors: Arc::new(ErrorCounters::new()),
            evictor,
        };
        Self {
            app: routes(state.clone()),
            state,
            dir,
        }
    }

    pub async fn standalone() -> Self {
        Self::new(StandaloneAac::new()).await
    }

    pub fn cache_file(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join("cache").join(name)
    }

    pub async fn send(&self, request: Request<Body>) -> Reply {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        Reply {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, dn: &str, uri: &str) -> Reply {
        self.send(
            Request::builder()
                .uri(uri)
                .header("USER_DN", dn)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn get_with(&self, dn: &str, uri: &str, headers: &[(&str, &str)]) -> Reply {
        let mut builder = Request::builder().uri(uri).header("USER_DN", dn);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    pub async fn json(&self, dn: &str, method: &str, uri: &str, body: Value) -> Reply {
        self.send(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("USER_DN", dn)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    pub async fn multipart(&self, dn: &str, uri: &str, metadata: Value, file_name: &str, content: &[u8]) -> Reply {
        self.send(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("USER_DN", dn)
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={BOUNDARY}"),
                )
                .body(Body::from(multipart_body(&metadata, file_name, content)))
                .unwrap(),
        )
        .await
    }

    /// Create a file as `dn` and return its JSON.
    pub async fn create_file(&self, dn: &str, acm: Value, content: &[u8]) -> Value {
        let reply = self
            .multipart(
                dn,
                "/objects",
                serde_json::json!({"name": "f", "typeName": "File", "acm": acm}),
                "f",
                content,
            )
            .await;
        assert_eq!(
            reply.status,
            StatusCode::OK,
            "{}",
            String::from_utf8_lossy(&reply.body)
        );
        reply.json()
    }

    /// Wait for the background push to leave a `.cached` file.
    pub async fn wait_for_cached(&self, connector_file: &str) {
        for _ in 0..200 {
            if self.cache_file(connector_file).exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{connector_file} never appeared");
    }
}

pub fn multipart_body(metadata: &Value, file_name: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"ObjectMetadata\"\r\nContent-Type: application/json\r\n\r\n{metadata}\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"filestream\"; filename=\"{file_name}\"\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

/// Connector of an object, read back from the metadata store.
pub async fn connector_of(harness: &Harness, id: &str) -> String {
    let id = object_drive::models::object::parse_object_id(id).unwrap();
    harness
        .state
        .metadata
        .get_object(id)
        .await
        .unwrap()
        .content_connector
        .unwrap()
}
