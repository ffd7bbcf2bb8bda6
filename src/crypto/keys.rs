//! Master key, file keys, and the per-permission wrapping scheme.
//!
//! Each permission carries its own random IV. `SHA-256("{master}:{hex(iv)}")`
//! is XORed with the file key to produce the wrapped key stored on the
//! permission, and an HMAC over the wrapped key and capability bits guards the
//! permission against tampering in the metadata store.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

use super::{KEY_SIZE, PERMISSION_IV_SIZE};
use crate::models::permission::{Capabilities, PermissionRecord};

type HmacSha256 = Hmac<Sha256>;

/// Blob key holding the master key fingerprint.
pub const CANARY_KEY: &str = "canary";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("master key must not be empty")]
    EmptyMasterKey,
    #[error("wrapped key must be {KEY_SIZE} bytes, got {0}")]
    InvalidWrappedKey(usize),
    #[error("permission iv must be {PERMISSION_IV_SIZE} bytes, got {0}")]
    InvalidPermissionIv(usize),
    #[error("permission mac does not validate for grantee `{0}`")]
    MacMismatch(String),
    #[error("hmac key rejected: {0}")]
    Hmac(String),
}

/// A per-object 256-bit content key. Zeroized on drop.
#[derive(Clone)]
pub struct FileKey {
    bytes: [u8; KEY_SIZE],
}

impl FileKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for FileKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random file key.
pub fn generate_file_key() -> FileKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    FileKey::from_bytes(bytes)
}

/// Generate a random permission IV.
pub fn generate_permission_iv() -> Vec<u8> {
    let mut iv = vec![0u8; PERMISSION_IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Process-wide master passphrase.
pub struct MasterKey {
    secret: String,
}

impl MasterKey {
    pub fn new(secret: impl Into<String>) -> Result<Self, KeyError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(KeyError::EmptyMasterKey);
        }
        Ok(Self { secret })
    }

    fn passphrase(&self, permission_iv: &[u8]) -> [u8; KEY_SIZE] {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(hex::encode(permission_iv).as_bytes());
        hasher.finalize().into()
    }

    /// XOR the file key with the passphrase derived for `permission_iv`.
    pub fn wrap(&self, file_key: &FileKey, permission_iv: &[u8]) -> Result<Vec<u8>, KeyError> {
        check_iv(permission_iv)?;
        let mut pass = self.passphrase(permission_iv);
        let wrapped = xor(file_key.as_bytes(), &pass);
        pass.zeroize();
        Ok(wrapped.to_vec())
    }

    pub fn unwrap(&self, wrapped: &[u8], permission_iv: &[u8]) -> Result<FileKey, KeyError> {
        check_iv(permission_iv)?;
        let wrapped: &[u8; KEY_SIZE] = wrapped
            .try_into()
            .map_err(|_| KeyError::InvalidWrappedKey(wrapped.len()))?;
        let mut pass = self.passphrase(permission_iv);
        let key = FileKey::from_bytes(xor(wrapped, &pass));
        pass.zeroize();
        Ok(key)
    }

    fn mac_for(
        &self,
        grantee: &str,
        capabilities: Capabilities,
        permission_iv: &[u8],
        wrapped: &[u8],
    ) -> Result<HmacSha256, KeyError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| KeyError::Hmac(e.to_string()))?;
        mac.update(permission_iv);
        mac.update(b":");
        mac.update(grantee.as_bytes());
        mac.update(b":");
        mac.update(capabilities.mac_string().as_bytes());
        mac.update(b":");
        mac.update(wrapped);
        Ok(mac)
    }

    /// Hex MAC over the grant's identity, capability bits and wrapped key.
    pub fn sign(
        &self,
        grantee: &str,
        capabilities: Capabilities,
        permission_iv: &[u8],
        wrapped: &[u8],
    ) -> Result<String, KeyError> {
        let mac = self.mac_for(grantee, capabilities, permission_iv, wrapped)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn verify(
        &self,
        grantee: &str,
        capabilities: Capabilities,
        permission_iv: &[u8],
        wrapped: &[u8],
        expected: &str,
    ) -> bool {
        let Ok(expected) = hex::decode(expected) else {
            return false;
        };
        match self.mac_for(grantee, capabilities, permission_iv, wrapped) {
            Ok(mac) => mac.verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }

    /// Fingerprint persisted next to the content so a wrong key is caught at startup.
    pub fn canary(&self) -> String {
        hex::encode(Sha256::digest(self.secret.as_bytes()))
    }

    pub fn matches_canary(&self, stored: &str) -> bool {
        self.canary() == stored.trim()
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

fn check_iv(permission_iv: &[u8]) -> Result<(), KeyError> {
    if permission_iv.len() != PERMISSION_IV_SIZE {
        return Err(KeyError::InvalidPermissionIv(permission_iv.len()));
    }
    Ok(())
}

fn xor(a: &[u8; KEY_SIZE], b: &[u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    let mut out = [0u8; KEY_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// Give `permission` a fresh IV, wrap `file_key` onto it and sign it.
pub fn seal_permission(
    master: &MasterKey,
    file_key: &FileKey,
    permission: &mut PermissionRecord,
) -> Result<(), KeyError> {
    let iv = generate_permission_iv();
    permission.encrypt_key = master.wrap(file_key, &iv)?;
    permission.permission_iv = iv;
    resign_permission(master, permission)
}

/// Recompute the MAC after capability bits change.
pub fn resign_permission(
    master: &MasterKey,
    permission: &mut PermissionRecord,
) -> Result<(), KeyError> {
    permission.permission_mac = master.sign(
        &permission.grantee,
        permission.capabilities(),
        &permission.permission_iv,
        &permission.encrypt_key,
    )?;
    Ok(())
}

pub fn permission_is_valid(master: &MasterKey, permission: &PermissionRecord) -> bool {
    master.verify(
        &permission.grantee,
        permission.capabilities(),
        &permission.permission_iv,
        &permission.encrypt_key,
        &permission.permission_mac,
    )
}

/// Recover the file key from a permission whose MAC validates.
pub fn unwrap_permission(
    master: &MasterKey,
    permission: &PermissionRecord,
) -> Result<FileKey, KeyError> {
    if !permission_is_valid(master, permission) {
        return Err(KeyError::MacMismatch(permission.grantee.clone()));
    }
    master.unwrap(&permission.encrypt_key, &permission.permission_iv)
}

/// Copy the file key from `source` onto `target` under a fresh target IV.
pub fn copy_encrypt_key(
    master: &MasterKey,
    source: &PermissionRecord,
    target: &mut PermissionRecord,
) -> Result<(), KeyError> {
    let file_key = unwrap_permission(master, source)?;
    seal_permission(master, &file_key, target)
}
