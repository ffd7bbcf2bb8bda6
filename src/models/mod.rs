//! Core data models for the object drive.
//!
//! Stored entities map to SQLite rows via `sqlx::FromRow`; their wire forms
//! serialize as camelCase JSON via `serde`. Markings stay open JSON trees.

pub mod marking;
pub mod object;
pub mod permission;
pub mod revision;
