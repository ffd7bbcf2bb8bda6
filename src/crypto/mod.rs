//! Content encryption and per-permission key wrapping.
//!
//! - [`cipher`] streams AES-256-CTR over content while hashing the plaintext.
//! - [`keys`] wraps the per-object file key for each permission using the
//!   process master key, and signs the permission's capability bits.

pub mod cipher;
pub mod keys;

/// File key length (AES-256).
pub const KEY_SIZE: usize = 32;

/// Object IV length (one AES block).
pub const IV_SIZE: usize = 16;

/// Per-permission IV length.
pub const PERMISSION_IV_SIZE: usize = 32;

/// AES block length used for counter arithmetic.
pub const BLOCK_SIZE: u64 = 16;
