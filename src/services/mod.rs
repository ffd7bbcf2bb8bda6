//! Domain services behind the HTTP handlers.

pub mod aac;
pub mod download_service;
pub mod metadata_service;
pub mod object_service;
pub mod performance;
pub mod reconciler;
pub mod share_service;
pub mod upload_service;
