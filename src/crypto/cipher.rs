//! AES-256-CTR streaming with a running SHA-256 over the plaintext.
//!
//! Encryption and decryption are the same keystream XOR; the only difference
//! is which side of the XOR gets hashed, so the digest always covers plaintext.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{BLOCK_SIZE, IV_SIZE, keys::FileKey};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("reading source stream: {0}")]
    Read(#[source] io::Error),
    #[error("writing destination stream after {written} bytes: {source}")]
    Write { written: u64, source: io::Error },
    #[error("iv must be {IV_SIZE} bytes, got {0}")]
    InvalidIv(usize),
}

/// Inclusive plaintext window applied to the output of a cipher pass.
///
/// `stop == None` copies through to the end of the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub stop: Option<u64>,
}

impl ByteRange {
    pub fn all() -> Self {
        Self {
            start: 0,
            stop: None,
        }
    }

    pub fn new(start: u64, stop: Option<u64>) -> Self {
        Self { start, stop }
    }

    /// Number of bytes to emit after skipping `start`, if bounded.
    pub fn limit(&self) -> Option<u64> {
        self.stop
            .filter(|stop| *stop >= self.start)
            .map(|stop| stop - self.start + 1)
    }
}

impl Default for ByteRange {
    fn default() -> Self {
        Self::all()
    }
}

/// Result of a full cipher pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDigest {
    pub sha256: [u8; 32],
    pub bytes_written: u64,
}

impl StreamDigest {
    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

/// Encrypt `src` into `dst`, hashing the plaintext as it is read.
pub async fn encrypt_stream<R, W>(
    src: &mut R,
    dst: &mut W,
    key: &FileKey,
    iv: &[u8],
    range: ByteRange,
) -> Result<StreamDigest, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    transform(Direction::Encrypt, src, dst, key, iv, range).await
}

/// Decrypt `src` into `dst`, hashing the recovered plaintext.
pub async fn decrypt_stream<R, W>(
    src: &mut R,
    dst: &mut W,
    key: &FileKey,
    iv: &[u8],
    range: ByteRange,
) -> Result<StreamDigest, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    transform(Direction::Decrypt, src, dst, key, iv, range).await
}

async fn transform<R, W>(
    direction: Direction,
    src: &mut R,
    dst: &mut W,
    key: &FileKey,
    iv: &[u8],
    range: ByteRange,
) -> Result<StreamDigest, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let iv: &[u8; IV_SIZE] = iv
        .try_into()
        .map_err(|_| CipherError::InvalidIv(iv.len()))?;
    let mut cipher = Aes256Ctr::new(key.as_bytes().into(), iv.into());
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    let mut skip = range.start;
    let mut remaining = range.limit();
    let mut written: u64 = 0;

    loop {
        if remaining == Some(0) {
            break;
        }
        let n = src.read(&mut buf).await.map_err(CipherError::Read)?;
        if n == 0 {
            break;
        }

        let chunk = &mut buf[..n];
        if let Direction::Encrypt = direction {
            hasher.update(&*chunk);
        }
        cipher.apply_keystream(chunk);
        if let Direction::Decrypt = direction {
            hasher.update(&*chunk);
        }

        let mut out: &[u8] = chunk;
        if skip > 0 {
            let dropped = skip.min(out.len() as u64);
            out = &out[dropped as usize..];
            skip -= dropped;
        }
        if let Some(left) = remaining.as_mut() {
            let take = (*left).min(out.len() as u64);
            out = &out[..take as usize];
            *left -= take;
        }
        if out.is_empty() {
            continue;
        }

        dst.write_all(out)
            .await
            .map_err(|source| CipherError::Write { written, source })?;
        written += out.len() as u64;
    }

    dst.flush()
        .await
        .map_err(|source| CipherError::Write { written, source })?;

    Ok(StreamDigest {
        sha256: hasher.finalize().into(),
        bytes_written: written,
    })
}

/// Fresh object IV. The trailing four bytes are zero so the counter can be
/// advanced for seeks without wrapping into the random prefix.
pub fn create_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv[IV_SIZE - 4..].fill(0);
    iv
}

/// Random blob name: 32 random bytes, hex encoded.
pub fn create_content_connector() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Counter block for the AES block containing `offset`.
pub fn adjust_iv(iv: &[u8; IV_SIZE], offset: u64) -> [u8; IV_SIZE] {
    let counter = u128::from_be_bytes(*iv).wrapping_add(u128::from(offset / BLOCK_SIZE));
    counter.to_be_bytes()
}

/// Largest block boundary at or below `offset`.
pub fn block_floor(offset: u64) -> u64 {
    offset - offset % BLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::generate_file_key;
    use proptest::prelude::*;

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }

    async fn encrypt_all(plain: &[u8], key: &FileKey, iv: &[u8]) -> (Vec<u8>, StreamDigest) {
        let mut out = Vec::new();
        let digest = encrypt_stream(&mut &plain[..], &mut out, key, iv, ByteRange::all())
            .await
            .unwrap();
        (out, digest)
    }

    #[tokio::test]
    async fn test_digest_covers_plaintext_both_ways() {
        let key = generate_file_key();
        let iv = create_iv();
        let plain = b"abcdefghijklmnopqrstuvwxyz0123456789".repeat(40);

        let (cipher_text, enc) = encrypt_all(&plain, &key, &iv).await;
        assert_ne!(cipher_text, plain);
        assert_eq!(enc.bytes_written, plain.len() as u64);

        let mut recovered = Vec::new();
        let dec = decrypt_stream(
            &mut &cipher_text[..],
            &mut recovered,
            &key,
            &iv,
            ByteRange::all(),
        )
        .await
        .unwrap();

        assert_eq!(recovered, plain);
        let expected: [u8; 32] = Sha256::digest(&plain).into();
        assert_eq!(enc.sha256, expected);
        assert_eq!(dec.sha256, expected);
    }

    #[tokio::test]
    async fn test_range_selects_inclusive_window() {
        let key = generate_file_key();
        let iv = create_iv();
        let plain: Vec<u8> = (0u8..64).collect();
        let (cipher_text, _) = encrypt_all(&plain, &key, &iv).await;

        let mut window = Vec::new();
        let digest = decrypt_stream(
            &mut &cipher_text[..],
            &mut window,
            &key,
            &iv,
            ByteRange::new(5, Some(34)),
        )
        .await
        .unwrap();

        assert_eq!(window, plain[5..35].to_vec());
        assert_eq!(digest.bytes_written, 30);
    }

    #[tokio::test]
    async fn test_open_range_and_skip_past_end() {
        let key = generate_file_key();
        let iv = create_iv();
        let plain = vec![7u8; 100];
        let (cipher_text, _) = encrypt_all(&plain, &key, &iv).await;

        let mut tail = Vec::new();
        decrypt_stream(
            &mut &cipher_text[..],
            &mut tail,
            &key,
            &iv,
            ByteRange::new(90, None),
        )
        .await
        .unwrap();
        assert_eq!(tail.len(), 10);

        let mut nothing = Vec::new();
        let digest = decrypt_stream(
            &mut &cipher_text[..],
            &mut nothing,
            &key,
            &iv,
            ByteRange::new(500, None),
        )
        .await
        .unwrap();
        assert!(nothing.is_empty());
        assert_eq!(digest.bytes_written, 0);
    }

    #[tokio::test]
    async fn test_adjusted_iv_decrypts_from_block_boundary() {
        let key = generate_file_key();
        let iv = create_iv();
        let plain: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let (cipher_text, _) = encrypt_all(&plain, &key, &iv).await;

        let offset = 517u64;
        let floor = block_floor(offset);
        let shifted = adjust_iv(&iv, offset);
        let mut out = Vec::new();
        decrypt_stream(
            &mut &cipher_text[floor as usize..],
            &mut out,
            &key,
            &shifted,
            ByteRange::new(offset - floor, Some(offset - floor + 99)),
        )
        .await
        .unwrap();

        assert_eq!(out, plain[517..617].to_vec());
    }

    #[tokio::test]
    async fn test_rejects_short_iv() {
        let key = generate_file_key();
        let mut out = Vec::new();
        let err = encrypt_stream(&mut &b"abc"[..], &mut out, &key, &[0u8; 8], ByteRange::all())
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::InvalidIv(8)));
    }

    #[test]
    fn test_iv_tail_is_zero_and_connector_is_hex() {
        let iv = create_iv();
        assert_eq!(&iv[12..], &[0, 0, 0, 0]);
        let connector = create_content_connector();
        assert_eq!(connector.len(), 64);
        assert!(connector.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(connector, create_content_connector());
    }

    #[test]
    fn test_range_limit() {
        assert_eq!(ByteRange::new(5, Some(34)).limit(), Some(30));
        assert_eq!(ByteRange::new(5, Some(5)).limit(), Some(1));
        assert_eq!(ByteRange::new(5, Some(4)).limit(), None);
        assert_eq!(ByteRange::all().limit(), None);
    }

    proptest! {
        #[test]
        fn prop_encrypt_then_decrypt_is_identity(plain in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let key = generate_file_key();
            let iv = create_iv();
            let recovered = block_on(async {
                let (cipher_text, _) = encrypt_all(&plain, &key, &iv).await;
                let mut out = Vec::new();
                decrypt_stream(&mut &cipher_text[..], &mut out, &key, &iv, ByteRange::all())
                    .await
                    .unwrap();
                out
            });
            prop_assert_eq!(recovered, plain);
        }
    }
}
