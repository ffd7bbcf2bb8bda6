use anyhow::{Context, Result, bail};
use axum::Router;
use sqlx::sqlite::SqliteConnectOptions;
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use object_drive::{
    cache::{
        blobstore::{BlobStore, OpendalBlobStore, build_s3_operator, memory_operator},
        drain::DrainProvider,
        eviction::{CacheEvictor, StatvfsUsage},
        fs::CacheFs,
    },
    config::AppConfig,
    crypto::keys::{CANARY_KEY, MasterKey},
    errors::ErrorCounters,
    routes,
    services::{
        aac::{AacClient, AuthorizationGateway, AuthorizationService, StandaloneAac},
        metadata_service::{MetadataService, open_pool},
        performance::PerformanceHandle,
    },
    state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args().context("loading configuration")?;
    tracing::info!("Starting object-drive with config: {}", cfg.summary());

    // --- Metadata store ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    let options = SqliteConnectOptions::from_str(&cfg.database_url)
        .with_context(|| format!("parsing database url `{}`", cfg.database_url))?;
    let db = Arc::new(
        open_pool(options, cfg.db_max_connections)
            .await
            .context("opening metadata database")?,
    );
    let metadata = MetadataService::new(db);
    let applied = metadata.migrate().await.context("running migrations")?;
    tracing::info!("Applied {} migration statements", applied);

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Blob store + master key canary ---
    let store: Arc<dyn BlobStore> = match &cfg.s3 {
        Some(s3) => Arc::new(OpendalBlobStore::new(build_s3_operator(s3)?, format!("s3://{}", s3.bucket))),
        None => {
            tracing::warn!("No OD_AWS_S3_BUCKET set; ciphertext drains to an in-process store");
            Arc::new(OpendalBlobStore::new(memory_operator()?, "memory"))
        }
    };
    let master = Arc::new(MasterKey::new(cfg.master_key.clone()).context("loading master key")?);
    check_canary(store.as_ref(), &master).await?;

    // --- Background collaborators ---
    let (perf, _perf_task) = PerformanceHandle::spawn();
    let cache = CacheFs::open(cfg.cache_dir())
        .await
        .context("opening cache directory")?;
    let drain = DrainProvider::new(cache.clone(), store, cfg.drain_settings(), perf.clone());
    drain.recover_on_startup().await.context("recovering cache")?;
    tokio::spawn(drain.clone().run_sweeper());

    let evictor = Arc::new(CacheEvictor::new(cache, Arc::new(StatvfsUsage), cfg.eviction.clone()));
    tokio::spawn(evictor.clone().run());

    let service: Arc<dyn AuthorizationService> = if cfg.standalone {
        tracing::warn!("Using the built-in authorization service");
        Arc::new(StandaloneAac::new())
    } else {
        Arc::new(
            AacClient::new(&cfg.aac_url, cfg.aac_timeout, cfg.aac_retries)
                .context("building authorization client")?,
        )
    };
    let aac = Arc::new(AuthorizationGateway::new(service, cfg.aac_snippet_cache, perf.clone()));

    let state = AppState {
        metadata,
        drain,
        aac,
        master,
        perf,
        errors: Arc::new(ErrorCounters::new()),
        evictor,
    };

    // --- Build router ---
    let app: Router = routes::routes::routes(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Refuse to start with a master key other than the one that wrapped the
/// keys already in the store. The first start records the canary.
async fn check_canary(store: &dyn BlobStore, master: &MasterKey) -> Result<()> {
    match store.read(CANARY_KEY).await.context("reading master key canary")? {
        Some(stored) => {
            let stored = String::from_utf8_lossy(&stored);
            if !master.matches_canary(&stored) {
                bail!("master key does not match the canary in {}", store.name());
            }
            tracing::info!("Master key canary verified");
        }
        None => {
            store
                .write(CANARY_KEY, master.canary().into_bytes())
                .await
                .context("writing master key canary")?;
            tracing::info!("Master key canary written to {}", store.name());
        }
    }
    Ok(())
}
