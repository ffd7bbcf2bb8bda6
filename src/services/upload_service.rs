//! Accepts new content: multipart create, metadata-only create and stream
//! replacement. Plaintext is encrypted on the way into the cache and never
//! touches disk.

use axum::extract::{Multipart, multipart::MultipartError};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::{io, path::PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    cache::state::CacheState,
    crypto::{
        cipher::{ByteRange, CipherError, create_content_connector, create_iv, encrypt_stream},
        keys::{FileKey, generate_file_key},
    },
    errors::{AppError, ErrorKind},
    models::{
        marking::Marking,
        object::{CreateObjectRequest, ObjectRecord, ObjectResponse, UpdateObjectRequest},
        permission::{Capabilities, PermissionRecord},
    },
    services::{
        metadata_service::Cascade,
        object_service::{access, caller_key, ensure_live, parse_id, require, respond, verify_change_token},
        performance::ReporterId,
        reconciler::{self, Edit, Settle, ShareMode},
    },
    state::AppState,
};

pub const METADATA_PART: &str = "ObjectMetadata";
pub const STREAM_PART: &str = "filestream";
pub const MAX_METADATA_BYTES: usize = 5 * 1024 * 1024;

const DEFAULT_CONTENT_TYPE: &str = "text/plain";

const CONTENT_TYPES: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("csv", "text/csv"),
    ("htm", "text/html"),
    ("html", "text/html"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("doc", "application/msword"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("xls", "application/vnd.ms-excel"),
    ("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
    ("ppt", "application/vnd.ms-powerpoint"),
    ("pptx", "application/vnd.openxmlformats-officedocument.presentationml.presentation"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
];

/// MIME type for a file name, by extension.
pub fn guess_content_type(file_name: &str) -> &'static str {
    let Some((_, ext)) = file_name.rsplit_once('.') else {
        return DEFAULT_CONTENT_TYPE;
    };
    CONTENT_TYPES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(ext))
        .map_or(DEFAULT_CONTENT_TYPE, |&(_, mime)| mime)
}

/// Ciphertext that reached `.uploaded`.
#[derive(Debug, Clone)]
pub struct StoredContent {
    pub connector: String,
    pub iv: Vec<u8>,
    pub size: u64,
    pub sha256: String,
}

/// Removes a partial `.uploading` file unless disarmed. Covers the
/// request future being dropped mid-stream.
struct UploadingGuard {
    path: Option<PathBuf>,
}

impl UploadingGuard {
    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for UploadingGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed partial upload"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "unable to remove partial upload"),
            }
        }
    }
}

fn bad_multipart(err: MultipartError) -> AppError {
    AppError::with_source(ErrorKind::MalformedRequest, "unable to read multipart body", err)
}

/// Encrypt `stream` into a fresh `.uploading` file and promote it to
/// `.uploaded` once the last byte is written.
pub async fn write_ciphertext<S>(state: &AppState, stream: S, file_key: &FileKey) -> Result<StoredContent, AppError>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let cache = state.drain.cache();
    let connector = create_content_connector();
    let iv = create_iv();
    let uploading = CacheState::Uploading.file_name(&connector);
    let uploaded = CacheState::Uploaded.file_name(&connector);

    let mut file = cache.create(&uploading).await?;
    let mut guard = UploadingGuard {
        path: Some(cache.path_for(&connector, CacheState::Uploading)?),
    };

    let job = state.perf.begin(ReporterId::Upload);
    let reader = StreamReader::new(stream);
    pin_mut!(reader);
    let digest = match encrypt_stream(&mut reader, &mut file, file_key, &iv, ByteRange::all()).await {
        Ok(digest) => digest,
        Err(e @ CipherError::Read(_)) => {
            job.fail();
            return Err(AppError::with_source(ErrorKind::MalformedRequest, "unable to read file stream", e));
        }
        Err(e) => {
            job.fail();
            return Err(e.into());
        }
    };
    if let Err(e) = file.flush().await {
        job.fail();
        return Err(AppError::with_source(ErrorKind::Internal, "unable to save file stream", e));
    }
    drop(file);

    cache.rename(&uploading, &uploaded).await?;
    guard.disarm();
    job.finish(digest.bytes_written);
    debug!(connector = %connector, bytes = digest.bytes_written, "ciphertext staged");

    Ok(StoredContent {
        connector,
        iv: iv.to_vec(),
        size: digest.bytes_written,
        sha256: digest.sha256_hex(),
    })
}

async fn discard_uploaded(state: &AppState, connector: &str) {
    if let Err(e) = state
        .drain
        .cache()
        .remove(&CacheState::Uploaded.file_name(connector))
        .await
    {
        warn!(connector, error = %e, "unable to remove uncommitted ciphertext");
    }
}

async fn read_metadata_part(multipart: &mut Multipart) -> Result<Vec<u8>, AppError> {
    let mut field = multipart
        .next_field()
        .await
        .map_err(bad_multipart)?
        .ok_or_else(|| AppError::malformed(format!("{METADATA_PART} part is required")))?;
    if field.name() != Some(METADATA_PART) {
        return Err(AppError::malformed(format!(
            "{METADATA_PART} must be the first part of the request"
        )));
    }
    let mut raw = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(bad_multipart)? {
        if raw.len() + chunk.len() > MAX_METADATA_BYTES {
            return Err(AppError::malformed(format!(
                "{METADATA_PART} exceeds {MAX_METADATA_BYTES} bytes"
            )));
        }
        raw.extend_from_slice(&chunk);
    }
    Ok(raw)
}

/// Name and type supplied by the file part itself.
#[derive(Debug, Default)]
struct PartHints {
    file_name: Option<String>,
    content_type: Option<String>,
}

impl PartHints {
    fn fill(&self, name: &mut String, content_type: &mut Option<String>) {
        if name.is_empty() {
            if let Some(file_name) = &self.file_name {
                *name = file_name.clone();
            }
        }
        if content_type.as_deref().is_none_or(str::is_empty) {
            let guessed = self
                .content_type
                .clone()
                .filter(|c| !c.is_empty() && c != "application/octet-stream")
                .unwrap_or_else(|| guess_content_type(name).to_string());
            *content_type = Some(guessed);
        }
    }
}

/// Consume the file part into the cache.
async fn read_stream_part(
    state: &AppState,
    multipart: &mut Multipart,
    file_key: &FileKey,
) -> Result<(StoredContent, PartHints), AppError> {
    let field = multipart
        .next_field()
        .await
        .map_err(bad_multipart)?
        .ok_or_else(|| AppError::malformed(format!("{STREAM_PART} part is required")))?;
    if field.name() != Some(STREAM_PART) {
        return Err(AppError::malformed(format!(
            "expected the {STREAM_PART} part after {METADATA_PART}"
        )));
    }
    let hints = PartHints {
        file_name: field.file_name().map(str::to_string),
        content_type: field.content_type().map(str::to_string),
    };
    let stream = field.map(|chunk| chunk.map_err(io::Error::other));
    let stored = write_ciphertext(state, stream, file_key).await?;
    Ok((stored, hints))
}

/// Validated, keyed and reconciled object ready to commit.
async fn prepare_create(
    state: &AppState,
    dn: &str,
    req: CreateObjectRequest,
    file_key: &FileKey,
) -> Result<ObjectRecord, AppError> {
    let type_name = if req.type_name.trim().is_empty() {
        "File".to_string()
    } else {
        req.type_name
    };
    let mut record = ObjectRecord::new(dn, &type_name, req.name.trim());
    record.description = req.description;
    record.content_type = req.content_type.filter(|c| !c.is_empty());

    if let Some(parent) = req.parent_id.as_deref().filter(|p| !p.is_empty()) {
        let parent = state.metadata.get_object(parse_id(parent)?).await?;
        ensure_live(&parent)?;
        let parent_access = access(state, dn, &parent).await?;
        require(
            parent_access.caps,
            Capabilities { create: true, ..Capabilities::NONE },
            "create children in",
        )?;
        record.parent_id = Some(parent.id);
    }

    let mut marking = Marking::from_value(req.acm)?;
    let requested: Vec<PermissionRecord> = req
        .permissions
        .iter()
        .filter_map(|g| g.to_record(record.id))
        .map(|mut p| {
            p.created_by = dn.to_string();
            p
        })
        .collect();
    reconciler::inject_read_into_share(&requested, &mut marking)?;

    let mut owner = PermissionRecord::for_user(record.id, dn, Capabilities::CRUDS);
    owner.created_by = dn.to_string();
    // a restricted share must keep naming the owner
    if !marking.share()?.is_empty() {
        reconciler::inject_read_into_share(std::slice::from_ref(&owner), &mut marking)?;
    }
    let mut grants = vec![owner];
    grants.extend(requested);

    let flat = reconciler::settle(
        &state.aac,
        &state.master,
        file_key,
        Settle {
            object_id: record.id,
            owner: dn,
            modifier: dn,
            mode: ShareMode::Keep,
            edit: Edit::Grant(grants),
        },
        &mut record.permissions,
        marking,
    )
    .await?;
    state.aac.check_access(dn, &flat).await?;
    record.raw_acm = flat.to_json();
    Ok(record)
}

async fn commit_new(state: &AppState, dn: &str, mut record: ObjectRecord) -> Result<ObjectResponse, AppError> {
    if record.name.is_empty() {
        record.name = format!("Unnamed {}", record.type_name);
    }
    let connector = record.content_connector.clone();
    if let Err(e) = state.metadata.create_object(&mut record).await {
        if let Some(connector) = &connector {
            discard_uploaded(state, connector).await;
        }
        return Err(e.into());
    }
    if let Some(connector) = &connector {
        state.drain.schedule_push(connector);
    }
    info!(id = %record.hex_id(), by = %dn, size = record.content_size, "object created");
    let grantees = state.aac.caller_grantees(dn).await?;
    Ok(respond(state, &record, &grantees))
}

/// `POST /objects` with a JSON body: a folder or empty file.
pub async fn create_metadata_only(
    state: &AppState,
    dn: &str,
    req: CreateObjectRequest,
) -> Result<ObjectResponse, AppError> {
    let file_key = generate_file_key();
    let record = prepare_create(state, dn, req, &file_key).await?;
    commit_new(state, dn, record).await
}

/// `POST /objects` with `multipart/form-data`.
pub async fn create_with_stream(state: &AppState, dn: &str, mut multipart: Multipart) -> Result<ObjectResponse, AppError> {
    let raw = read_metadata_part(&mut multipart).await?;
    let req: CreateObjectRequest = serde_json::from_slice(&raw).map_err(|e| {
        AppError::with_source(ErrorKind::MalformedRequest, format!("invalid {METADATA_PART}"), e)
    })?;
    let file_key = generate_file_key();

    // All checks run before the body is consumed; name and type hints
    // from the file part are applied afterwards.
    let mut record = prepare_create(state, dn, req, &file_key).await?;
    let (stored, hints) = read_stream_part(state, &mut multipart, &file_key).await?;
    hints.fill(&mut record.name, &mut record.content_type);
    record.content_connector = Some(stored.connector);
    record.encrypt_iv = Some(stored.iv);
    record.content_size = stored.size as i64;
    record.content_hash = Some(stored.sha256);
    commit_new(state, dn, record).await
}

/// `POST /objects/{id}/stream`: replace content, keeping the file key.
pub async fn update_stream(
    state: &AppState,
    dn: &str,
    id: Uuid,
    mut multipart: Multipart,
) -> Result<ObjectResponse, AppError> {
    let raw = read_metadata_part(&mut multipart).await?;
    let req: UpdateObjectRequest = serde_json::from_slice(&raw).map_err(|e| {
        AppError::with_source(ErrorKind::MalformedRequest, format!("invalid {METADATA_PART}"), e)
    })?;
    if let Some(body_id) = req.id.as_deref().filter(|s| !s.is_empty()) {
        if parse_id(body_id)? != id {
            return Err(AppError::malformed("id in body does not match the url"));
        }
    }

    let mut record = state.metadata.get_object(id).await?;
    verify_change_token(&record, &req.change_token)?;
    ensure_live(&record)?;
    let access = access(state, dn, &record).await?;
    require(access.caps, Capabilities { update: true, ..Capabilities::NONE }, "update")?;
    state.aac.check_access(dn, &Marking::parse(&record.raw_acm)?).await?;
    let (file_key, _) = caller_key(&state.master, &record.permissions, &access.grantees, false)?;

    let (stored, hints) = read_stream_part(state, &mut multipart, &file_key).await?;
    if let Some(name) = req.name.filter(|n| !n.is_empty()) {
        record.name = name;
    }
    if let Some(description) = req.description {
        record.description = description;
    }
    let mut content_type = req.content_type.filter(|c| !c.is_empty());
    let mut name = record.name.clone();
    hints.fill(&mut name, &mut content_type);
    record.content_type = content_type;
    record.content_connector = Some(stored.connector.clone());
    record.encrypt_iv = Some(stored.iv);
    record.content_size = stored.size as i64;
    record.content_hash = Some(stored.sha256);
    record.modified_by = dn.to_string();

    if let Err(e) = state
        .metadata
        .update_object(&mut record, &req.change_token, Cascade::None)
        .await
    {
        discard_uploaded(state, &stored.connector).await;
        return Err(e.into());
    }
    state.drain.schedule_push(&stored.connector);
    info!(id = %record.hex_id(), by = %dn, size = record.content_size, "object content replaced");
    Ok(respond(state, &record, &access.grantees))
}
