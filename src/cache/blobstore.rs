//! Remote blob store holding the durable copy of every ciphertext.

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use opendal::Operator;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const TRANSFER_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("blob store: {0}")]
    Backend(#[from] opendal::Error),
    #[error("local i/o during blob transfer: {0}")]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobStoreError>;

/// Durable key/value storage for ciphertext, addressed by content connector.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream `src` to `key`, returning the bytes sent.
    async fn upload(&self, key: &str, src: &mut (dyn AsyncRead + Send + Unpin)) -> BlobResult<u64>;

    /// Stream the whole of `key` into `dst`, returning the bytes received.
    async fn download(&self, key: &str, dst: &mut (dyn AsyncWrite + Send + Unpin))
    -> BlobResult<u64>;

    /// Small whole-object read. `None` if the key is absent.
    async fn read(&self, key: &str) -> BlobResult<Option<Vec<u8>>>;

    async fn write(&self, key: &str, data: Vec<u8>) -> BlobResult<()>;

    async fn delete(&self, key: &str) -> BlobResult<()>;

    async fn exists(&self, key: &str) -> BlobResult<bool>;

    /// Name for logs.
    fn name(&self) -> &str;
}

/// Connection settings for an S3-compatible store.
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// Build an S3 operator. Path-style addressing works with MinIO and friends.
pub fn build_s3_operator(cfg: &S3Settings) -> anyhow::Result<Operator> {
    use anyhow::Context;

    let mut builder = opendal::services::S3::default()
        .region(&cfg.region)
        .bucket(&cfg.bucket);
    if let Some(endpoint) = &cfg.endpoint {
        builder = builder.endpoint(endpoint);
    }
    if let Some(key) = &cfg.access_key_id {
        builder = builder.access_key_id(key);
    }
    if let Some(secret) = &cfg.secret_access_key {
        builder = builder.secret_access_key(secret);
    }

    let op = Operator::new(builder)
        .context("creating S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(3)
                .with_jitter(),
        )
        .finish();
    Ok(op)
}

/// In-process store, for tests and single-node development.
pub fn memory_operator() -> anyhow::Result<Operator> {
    Ok(Operator::new(opendal::services::Memory::default())?.finish())
}

/// [`BlobStore`] over an OpenDAL operator.
#[derive(Clone)]
pub struct OpendalBlobStore {
    op: Operator,
    name: String,
}

impl OpendalBlobStore {
    pub fn new(op: Operator, name: impl Into<String>) -> Self {
        Self {
            op,
            name: name.into(),
        }
    }
}

fn not_found_or(key: &str, err: opendal::Error) -> BlobStoreError {
    if err.kind() == opendal::ErrorKind::NotFound {
        BlobStoreError::NotFound(key.to_string())
    } else {
        BlobStoreError::Backend(err)
    }
}

#[async_trait]
impl BlobStore for OpendalBlobStore {
    async fn upload(&self, key: &str, src: &mut (dyn AsyncRead + Send + Unpin)) -> BlobResult<u64> {
        let mut writer = self.op.writer(key).await?;
        let mut buf = vec![0u8; TRANSFER_CHUNK];
        let mut total = 0u64;
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write(Bytes::copy_from_slice(&buf[..n])).await?;
            total += n as u64;
        }
        writer.close().await?;
        debug!(store = %self.name, key, bytes = total, "blob uploaded");
        Ok(total)
    }

    async fn download(
        &self,
        key: &str,
        dst: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> BlobResult<u64> {
        let reader = self.op.reader(key).await.map_err(|e| not_found_or(key, e))?;
        let mut stream = reader
            .into_bytes_stream(..)
            .await
            .map_err(|e| not_found_or(key, e))?;
        let mut total = 0u64;
        while let Some(chunk) = stream.try_next().await? {
            dst.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        dst.flush().await?;
        debug!(store = %self.name, key, bytes = total, "blob downloaded");
        Ok(total)
    }

    async fn read(&self, key: &str) -> BlobResult<Option<Vec<u8>>> {
        match self.op.read(key).await {
            Ok(data) => Ok(Some(data.to_vec())),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> BlobResult<()> {
        self.op.write(key, data).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.op.delete(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> BlobResult<bool> {
        Ok(self.op.exists(key).await?)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
