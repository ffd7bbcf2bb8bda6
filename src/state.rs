//! Shared collaborators handed to every handler.

use std::sync::Arc;

use crate::{
    cache::{drain::DrainProvider, eviction::CacheEvictor},
    crypto::keys::MasterKey,
    errors::ErrorCounters,
    services::{aac::AuthorizationGateway, metadata_service::MetadataService, performance::PerformanceHandle},
};

/// Process-wide singletons, created once at startup.
#[derive(Clone)]
pub struct AppState {
    pub metadata: MetadataService,
    pub drain: DrainProvider,
    pub aac: Arc<AuthorizationGateway>,
    pub master: Arc<MasterKey>,
    pub perf: PerformanceHandle,
    pub errors: Arc<ErrorCounters>,
    pub evictor: Arc<CacheEvictor>,
}
