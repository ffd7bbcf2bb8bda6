//! Encrypted multi-tenant object drive.
//!
//! Content is encrypted per object with AES-256-CTR; each grant on an object
//! carries its own wrapped copy of the file key. Ciphertext lands in a local
//! cache and drains to a blob store in the background. Access decisions are
//! delegated to an external authorization service that reads the object's
//! marking.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
