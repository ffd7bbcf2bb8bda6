//! Serves decrypted content with conditional and ranged responses.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use std::{collections::BTreeSet, time::SystemTime};
use tokio::io::{AsyncSeekExt, SeekFrom};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    cache::state::CacheState,
    crypto::{
        IV_SIZE,
        cipher::{ByteRange, adjust_iv, block_floor, decrypt_stream},
    },
    errors::{AppError, ErrorKind},
    models::{marking::Marking, permission::PermissionRecord},
    services::{
        object_service::{caller_key, ensure_live, load_live},
        performance::ReporterId,
    },
    state::AppState,
};

const PIPE_CAPACITY: usize = 64 * 1024;

pub const BANNER_HEADER: &str = "classification-banner";

/// Everything needed to stream one version of an object.
#[derive(Debug, Clone)]
pub struct ContentSource {
    pub name: String,
    pub raw_acm: String,
    pub change_token: String,
    pub content_connector: Option<String>,
    pub content_type: Option<String>,
    pub content_size: u64,
    pub encrypt_iv: Option<Vec<u8>>,
    pub permissions: Vec<PermissionRecord>,
}

/// `?disposition=attachment` or the default `inline`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Disposition {
    #[default]
    Inline,
    Attachment,
}

impl Disposition {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some(v) if v.eq_ignore_ascii_case("attachment") => Disposition::Attachment,
            _ => Disposition::Inline,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Disposition::Inline => "inline",
            Disposition::Attachment => "attachment",
        }
    }
}

/// Percent-escape everything outside the RFC 3986 unreserved set.
pub fn escape_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Parse `bytes=s-e`, `bytes=s-` or `bytes=-n` against a body of `size` bytes.
///
/// `Ok(None)` means serve everything; an unsatisfiable or malformed range
/// is an error.
pub fn parse_range(raw: Option<&str>, size: u64) -> Result<Option<ByteRange>, AppError> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(None);
    };
    let spec = raw
        .strip_prefix("bytes=")
        .ok_or_else(|| AppError::malformed(format!("unsupported range `{raw}`")))?;
    if spec.contains(',') {
        return Err(AppError::malformed("multiple ranges are not supported"));
    }
    let (start, stop) = spec
        .split_once('-')
        .ok_or_else(|| AppError::malformed(format!("invalid range `{raw}`")))?;
    if start.trim().is_empty() {
        // suffix form: the last n bytes
        let n: u64 = stop
            .trim()
            .parse()
            .map_err(|_| AppError::malformed(format!("invalid range `{raw}`")))?;
        if n == 0 || size == 0 {
            return Err(AppError::malformed(format!(
                "range `{raw}` not satisfiable for {size} bytes"
            )));
        }
        return Ok(Some(ByteRange::new(size - n.min(size), Some(size - 1))));
    }
    let start: u64 = start
        .trim()
        .parse()
        .map_err(|_| AppError::malformed(format!("invalid range `{raw}`")))?;
    let stop: Option<u64> = match stop.trim() {
        "" => None,
        s => Some(
            s.parse()
                .map_err(|_| AppError::malformed(format!("invalid range `{raw}`")))?,
        ),
    };
    if start >= size || stop.is_some_and(|s| s < start) {
        return Err(AppError::malformed(format!(
            "range `{raw}` not satisfiable for {size} bytes"
        )));
    }
    let stop = stop.map_or(size - 1, |s| s.min(size - 1));
    Ok(Some(ByteRange::new(start, Some(stop))))
}

fn etag(permission: &PermissionRecord, change_token: &str) -> String {
    let prefix: String = permission.permission_mac.chars().take(8).collect();
    format!("\"{prefix}-{change_token}\"")
}

fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().trim_start_matches("W/"))
        .any(|candidate| candidate == "*" || candidate == etag)
}

fn header_value(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value).map_err(|e| AppError::with_source(ErrorKind::Internal, "invalid header value", e))
}

/// `GET /objects/{id}/stream`
pub async fn download_object(
    state: &AppState,
    dn: &str,
    id: Uuid,
    headers: &HeaderMap,
    disposition: Disposition,
) -> Result<Response, AppError> {
    let record = load_live(state, id).await?;
    let source = ContentSource {
        name: record.name.clone(),
        raw_acm: record.raw_acm.clone(),
        change_token: record.change_token.clone(),
        content_connector: record.content_connector.clone(),
        content_type: record.content_type.clone(),
        content_size: record.content_size.max(0) as u64,
        encrypt_iv: record.encrypt_iv.clone(),
        permissions: record.permissions,
    };
    serve(state, dn, source, headers, disposition).await
}

/// `GET /revisions/{id}/{rev}/stream`. Keys come from the permissions as
/// they stood at that revision.
pub async fn download_revision(
    state: &AppState,
    dn: &str,
    id: Uuid,
    change_count: i64,
    headers: &HeaderMap,
    disposition: Disposition,
) -> Result<Response, AppError> {
    let current = state.metadata.get_object(id).await?;
    ensure_live(&current)?;
    let revision = state.metadata.get_revision(id, change_count).await?;
    let permissions = revision
        .permission_snapshot()
        .map_err(|e| AppError::with_source(ErrorKind::Internal, "unreadable revision permissions", e))?;
    let source = ContentSource {
        name: revision.name.clone(),
        raw_acm: revision.raw_acm.clone(),
        change_token: revision.change_token.clone(),
        content_connector: revision.content_connector.clone(),
        content_type: revision.content_type.clone(),
        content_size: revision.content_size.max(0) as u64,
        encrypt_iv: revision.encrypt_iv.clone(),
        permissions,
    };
    serve(state, dn, source, headers, disposition).await
}

async fn serve(
    state: &AppState,
    dn: &str,
    source: ContentSource,
    headers: &HeaderMap,
    disposition: Disposition,
) -> Result<Response, AppError> {
    let grantees: BTreeSet<String> = state.aac.caller_grantees(dn).await?;
    let (file_key, permission) = caller_key(&state.master, &source.permissions, &grantees, true)?;
    let marking = Marking::parse(&source.raw_acm)?;
    state.aac.check_access(dn, &marking).await?;

    let tag = etag(&permission, &source.change_token);
    if etag_matches(headers, &tag) {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NOT_MODIFIED;
        response.headers_mut().insert(header::ETAG, header_value(&tag)?);
        return Ok(response);
    }

    let size = source.content_size;
    let connector = match source.content_connector.as_deref() {
        Some(c) if size > 0 => c.to_string(),
        _ => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NO_CONTENT;
            response.headers_mut().insert(header::ETAG, header_value(&tag)?);
            return Ok(response);
        }
    };

    let range = parse_range(
        headers.get(header::RANGE).and_then(|v| v.to_str().ok()),
        size,
    )?;

    let iv: [u8; IV_SIZE] = source
        .encrypt_iv
        .as_deref()
        .and_then(|iv| iv.try_into().ok())
        .ok_or_else(|| AppError::internal("object has no usable encryption iv"))?;

    let job = state.perf.begin(ReporterId::Download);
    let (mut file, cache_state) = state.drain.open_ciphertext(&connector).await?;

    // Seek whole blocks; the cipher discards the remainder.
    let requested = range.unwrap_or_else(|| ByteRange::new(0, Some(size - 1)));
    let floor = block_floor(requested.start);
    if floor > 0 {
        file.seek(SeekFrom::Start(floor))
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Internal, "error reading content", e))?;
    }
    let stream_iv = adjust_iv(&iv, floor);
    let cipher_range = ByteRange::new(
        requested.start - floor,
        requested.stop.map(|stop| stop - floor),
    );
    let length = requested.stop.map_or(size, |stop| stop - requested.start + 1);

    let (reader, mut writer) = tokio::io::duplex(PIPE_CAPACITY);
    let drain = state.drain.clone();
    tokio::spawn(async move {
        match decrypt_stream(&mut file, &mut writer, &file_key, &stream_iv, cipher_range).await {
            Ok(digest) => {
                job.finish(digest.bytes_written);
                // a push may have renamed .uploaded meanwhile
                let touched = [cache_state, CacheState::Cached];
                for state in touched {
                    if drain
                        .cache()
                        .chtimes(&state.file_name(&connector), SystemTime::now())
                        .await
                        .is_ok()
                    {
                        break;
                    }
                }
                debug!(connector = %connector, bytes = digest.bytes_written, "content served");
            }
            Err(e) => {
                job.fail();
                warn!(connector = %connector, error = %e, "download interrupted");
            }
        }
    });

    let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
    let out = response.headers_mut();
    out.insert(
        header::CONTENT_TYPE,
        header_value(source.content_type.as_deref().unwrap_or("application/octet-stream"))?,
    );
    out.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    out.insert(
        header::CONTENT_DISPOSITION,
        header_value(&format!(
            "{}; filename={}",
            disposition.as_str(),
            escape_filename(&source.name)
        ))?,
    );
    out.insert(header::ETAG, header_value(&tag)?);
    if let Some(banner) = marking.banner() {
        out.insert(BANNER_HEADER, header_value(banner)?);
    }
    match range {
        Some(r) => {
            out.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
            out.insert(
                header::CONTENT_RANGE,
                header_value(&format!(
                    "bytes {}-{}/{}",
                    r.start,
                    r.stop.unwrap_or(size - 1),
                    size
                ))?,
            );
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
        }
        None => {
            out.insert(header::ACCEPT_RANGES, HeaderValue::from_static("none"));
            *response.status_mut() = StatusCode::OK;
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range(None, 100).unwrap(), None);
        assert_eq!(
            parse_range(Some("bytes=10-39"), 100).unwrap(),
            Some(ByteRange::new(10, Some(39)))
        );
        assert_eq!(
            parse_range(Some("bytes=90-"), 100).unwrap(),
            Some(ByteRange::new(90, Some(99)))
        );
        assert_eq!(
            parse_range(Some("bytes=90-500"), 100).unwrap(),
            Some(ByteRange::new(90, Some(99)))
        );
        for bad in ["bytes=100-", "bytes=5-1", "items=1-2", "bytes=a-b", "bytes=1-2,4-5", "bytes=-0", "bytes=-"] {
            assert_eq!(parse_range(Some(bad), 100).unwrap_err().status().as_u16(), 400, "{bad}");
        }
    }

    #[test]
    fn test_parse_suffix_range() {
        assert_eq!(
            parse_range(Some("bytes=-10"), 100).unwrap(),
            Some(ByteRange::new(90, Some(99)))
        );
        assert_eq!(
            parse_range(Some("bytes=-1"), 100).unwrap(),
            Some(ByteRange::new(99, Some(99)))
        );
        // longer than the body means all of it
        assert_eq!(
            parse_range(Some("bytes=-500"), 100).unwrap(),
            Some(ByteRange::new(0, Some(99)))
        );
        assert_eq!(parse_range(Some("bytes=-5"), 0).unwrap_err().status().as_u16(), 400);
    }

    #[test]
    fn test_escape_filename() {
        assert_eq!(escape_filename("report.txt"), "report.txt");
        assert_eq!(escape_filename("my file (1).txt"), "my%20file%20%281%29.txt");
        assert_eq!(escape_filename("é"), "%C3%A9");
    }

    #[test]
    fn test_if_none_match() {
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"x\", W/\"abcd-1\""));
        assert!(etag_matches(&headers, "\"abcd-1\""));
        assert!(!etag_matches(&headers, "\"abcd-2\""));
        assert_eq!(Disposition::parse(Some("ATTACHMENT")), Disposition::Attachment);
        assert_eq!(Disposition::parse(None), Disposition::Inline);
    }
}
