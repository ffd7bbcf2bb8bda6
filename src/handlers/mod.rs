//! Axum handlers. Each one extracts the caller and request parts and hands
//! off to a service.

pub mod caller;
pub mod health_handlers;
pub mod json_body;
pub mod object_handlers;
pub mod share_handlers;
