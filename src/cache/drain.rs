//! Moves ciphertext between the local cache and the blob store.
//!
//! Uploads land as `.uploaded` and are pushed on a bounded worker pool, then
//! renamed to `.cached`. Reads that miss the cache pull the blob back through
//! `.caching`. Creating `.caching` with `create_new` is the single-flight
//! lock: whoever creates it fetches, everyone else polls for `.cached`.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio::{fs::File, sync::Semaphore, task::JoinHandle};
use tracing::{debug, error, info, warn};

use super::{
    CacheError,
    blobstore::{BlobStore, BlobStoreError},
    fs::CacheFs,
    state::CacheState,
};
use crate::services::performance::{PerformanceHandle, ReporterId};

#[derive(Debug, Error)]
pub enum DrainError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    BlobStore(#[from] BlobStoreError),
    #[error("could not fetch `{connector}` after {attempts} attempts")]
    PullFailed { connector: String, attempts: u32 },
    #[error("could not push `{connector}` after {attempts} attempts")]
    PushFailed { connector: String, attempts: u32 },
}

/// Retry and pacing knobs. Defaults match production; tests shrink them.
#[derive(Debug, Clone)]
pub struct DrainSettings {
    /// Concurrent pushes.
    pub workers: usize,
    pub push_attempts: u32,
    /// Sleep after push attempt `n` is `push_backoff * n`.
    pub push_backoff: Duration,
    pub pull_attempts: u32,
    /// One step of the Fibonacci sleep sequence.
    pub pull_unit: Duration,
    /// Total sleep allowed across pull retries.
    pub pull_budget: Duration,
    pub stall_initial: Duration,
    pub stall_max: Duration,
    /// Interval of the background sweep for `.uploaded` files.
    pub sweep_interval: Duration,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            push_attempts: 3,
            push_backoff: Duration::from_secs(1),
            pull_attempts: 22,
            pull_unit: Duration::from_secs(1),
            pull_budget: Duration::from_secs(120),
            stall_initial: Duration::from_secs(1),
            stall_max: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Sleeps between pull attempts: `unit * fib(n)` until either the attempt
/// count or the cumulative budget runs out.
pub fn pull_delays(unit: Duration, attempts: u32, budget: Duration) -> Vec<Duration> {
    let mut delays = Vec::new();
    let (mut prev, mut cur) = (0u32, 1u32);
    let mut spent = Duration::ZERO;
    for _ in 1..attempts {
        let delay = unit * cur;
        if spent + delay > budget {
            break;
        }
        spent += delay;
        delays.push(delay);
        (prev, cur) = (cur, prev.saturating_add(cur));
    }
    delays
}

/// What a startup walk found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    pub pushes_scheduled: usize,
    pub partials_removed: usize,
}

#[derive(Clone)]
pub struct DrainProvider {
    inner: Arc<Inner>,
}

struct Inner {
    cache: CacheFs,
    store: Arc<dyn BlobStore>,
    workers: Arc<Semaphore>,
    settings: DrainSettings,
    perf: PerformanceHandle,
    pushing: Mutex<HashSet<String>>,
}

impl DrainProvider {
    pub fn new(
        cache: CacheFs,
        store: Arc<dyn BlobStore>,
        settings: DrainSettings,
        perf: PerformanceHandle,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(settings.workers.max(1)));
        Self {
            inner: Arc::new(Inner {
                cache,
                store,
                workers,
                settings,
                perf,
                pushing: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn cache(&self) -> &CacheFs {
        &self.inner.cache
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.inner.store
    }

    /// Send `.uploaded` to the blob store and mark it `.cached`.
    pub async fn push(&self, connector: &str) -> Result<u64, DrainError> {
        let cache = &self.inner.cache;
        let uploaded = CacheState::Uploaded.file_name(connector);
        let job = self.inner.perf.begin(ReporterId::DrainTo);

        let mut file = cache.open_file(&uploaded).await?;
        let sent = self.inner.store.upload(connector, &mut file).await?;
        drop(file);

        cache
            .rename(&uploaded, &CacheState::Cached.file_name(connector))
            .await?;
        job.finish(sent);
        info!(connector, bytes = sent, store = self.inner.store.name(), "drained to blob store");
        Ok(sent)
    }

    /// [`push`](Self::push) with bounded retries. After the last failure the
    /// `.uploaded` file is removed.
    pub async fn push_with_retries(&self, connector: &str) -> Result<(), DrainError> {
        let settings = &self.inner.settings;
        let attempts = settings.push_attempts.max(1);
        let cached = CacheState::Cached.file_name(connector);
        for attempt in 1..=attempts {
            match self.push(connector).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if matches!(e, DrainError::Cache(CacheError::NotFound(_)))
                        && self.inner.cache.exists(&cached).await?
                    {
                        debug!(connector, "already drained");
                        return Ok(());
                    }
                    warn!(connector, attempt, error = %e, "push to blob store failed");
                    if attempt < attempts {
                        tokio::time::sleep(settings.push_backoff * attempt).await;
                    }
                }
            }
        }
        error!(connector, attempts, "giving up on push; removing uploaded ciphertext");
        self.inner
            .cache
            .remove(&CacheState::Uploaded.file_name(connector))
            .await?;
        Err(DrainError::PushFailed {
            connector: connector.to_string(),
            attempts,
        })
    }

    /// Queue a push on the worker pool. Returns `None` when a push for the
    /// connector is already queued or running.
    pub fn schedule_push(&self, connector: &str) -> Option<JoinHandle<()>> {
        {
            let mut pushing = self
                .inner
                .pushing
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !pushing.insert(connector.to_string()) {
                return None;
            }
        }
        let this = self.clone();
        let connector = connector.to_string();
        Some(tokio::spawn(async move {
            if let Ok(_permit) = this.inner.workers.clone().acquire_owned().await {
                if let Err(e) = this.push_with_retries(&connector).await {
                    error!(connector = %connector, error = %e, "drain failed");
                }
            }
            this.inner
                .pushing
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&connector);
        }))
    }

    /// Take the `.caching` lock for `connector` and start a detached pull.
    /// Returns `false` when another pull holds the lock or the file is
    /// already cached.
    pub async fn start_pull(&self, connector: &str) -> Result<bool, DrainError> {
        let cache = &self.inner.cache;
        let caching = CacheState::Caching.file_name(connector);
        let file = match cache.create(&caching).await {
            Ok(file) => file,
            Err(CacheError::AlreadyExists(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if cache.exists(&CacheState::Cached.file_name(connector)).await? {
            drop(file);
            cache.remove(&caching).await?;
            return Ok(false);
        }

        let this = self.clone();
        let connector = connector.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.pull(&connector, file).await {
                error!(connector = %connector, error = %e, "pull from blob store failed");
            }
        });
        Ok(true)
    }

    /// Fetch into the already-created `.caching` file, retrying with
    /// Fibonacci sleeps, then rename to `.cached`.
    async fn pull(&self, connector: &str, first: File) -> Result<u64, DrainError> {
        let cache = &self.inner.cache;
        let settings = &self.inner.settings;
        let caching = CacheState::Caching.file_name(connector);
        let delays = pull_delays(
            settings.pull_unit,
            settings.pull_attempts,
            settings.pull_budget,
        );
        let attempts = delays.len() as u32 + 1;
        let job = self.inner.perf.begin(ReporterId::DrainFrom);

        let mut file = Some(first);
        for attempt in 1..=attempts {
            let mut out = match file.take() {
                Some(f) => f,
                None => cache.rewrite(&caching).await?,
            };
            let result = self.inner.store.download(connector, &mut out).await;
            let synced = match result {
                Ok(n) => out.sync_all().await.map(|_| n).map_err(|e| {
                    DrainError::Cache(CacheError::io(&caching, e))
                }),
                Err(e) => Err(e.into()),
            };
            drop(out);
            match synced {
                Ok(n) => {
                    if let Err(e) = cache
                        .rename(&caching, &CacheState::Cached.file_name(connector))
                        .await
                    {
                        error!(connector, error = %e, "could not promote fetched ciphertext");
                        if let Err(cleanup) = cache.remove(&caching).await {
                            warn!(connector, error = %cleanup, "could not remove caching file");
                        }
                        return Err(e.into());
                    }
                    job.finish(n);
                    info!(connector, bytes = n, attempt, "fetched ciphertext");
                    return Ok(n);
                }
                Err(e) => {
                    let delay = delays.get(attempt as usize - 1).copied();
                    warn!(connector, attempt, error = %e, ?delay, "fetch from blob store failed");
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        error!(connector, attempts, "giving up on fetching ciphertext");
        cache.remove(&caching).await?;
        Err(DrainError::PullFailed {
            connector: connector.to_string(),
            attempts,
        })
    }

    /// Poll until `.cached` appears. Fails if the pull ends without it.
    pub async fn wait_for_cached(&self, connector: &str) -> Result<(), DrainError> {
        let cache = &self.inner.cache;
        let settings = &self.inner.settings;
        let cached = CacheState::Cached.file_name(connector);
        let caching = CacheState::Caching.file_name(connector);
        let mut delay = settings.stall_initial;
        loop {
            if cache.exists(&cached).await? {
                return Ok(());
            }
            if !cache.exists(&caching).await? {
                if cache.exists(&cached).await? {
                    return Ok(());
                }
                return Err(DrainError::PullFailed {
                    connector: connector.to_string(),
                    attempts: 0,
                });
            }
            debug!(connector, ?delay, "stalling for ciphertext");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(settings.stall_max);
        }
    }

    /// Open the local ciphertext for `connector`, fetching it back from the
    /// blob store when neither a cached nor an undrained copy is present.
    pub async fn open_ciphertext(&self, connector: &str) -> Result<(File, CacheState), DrainError> {
        let cache = &self.inner.cache;
        let cached = CacheState::Cached.file_name(connector);
        let uploaded = CacheState::Uploaded.file_name(connector);

        // Two rounds cover a push renaming .uploaded to .cached under us.
        for _ in 0..2 {
            match cache.open_file(&cached).await {
                Ok(file) => return Ok((file, CacheState::Cached)),
                Err(CacheError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            match cache.open_file(&uploaded).await {
                Ok(file) => {
                    self.schedule_push(connector);
                    return Ok((file, CacheState::Uploaded));
                }
                Err(CacheError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.start_pull(connector).await?;
        self.wait_for_cached(connector).await?;
        let file = cache.open_file(&cached).await?;
        Ok((file, CacheState::Cached))
    }

    /// Startup walk: push what was never drained and drop partial files.
    pub async fn recover_on_startup(&self) -> Result<RecoveryStats, DrainError> {
        let cache = &self.inner.cache;
        let mut stats = RecoveryStats::default();
        for entry in cache.walk().await? {
            match CacheState::parse(&entry.name) {
                Some((connector, CacheState::Uploaded)) => {
                    info!(connector, "recovering undrained upload");
                    if self.schedule_push(connector).is_some() {
                        stats.pushes_scheduled += 1;
                    }
                }
                Some((_, CacheState::Caching | CacheState::Uploading)) => {
                    cache.remove(&entry.name).await?;
                    stats.partials_removed += 1;
                }
                _ => {}
            }
        }
        info!(
            pushes = stats.pushes_scheduled,
            removed = stats.partials_removed,
            "cache recovery done"
        );
        Ok(stats)
    }

    /// Number of files still waiting to be drained.
    pub async fn count_uploaded(&self) -> Result<usize, DrainError> {
        Ok(self
            .inner
            .cache
            .walk()
            .await?
            .iter()
            .filter(|e| matches!(CacheState::parse(&e.name), Some((_, CacheState::Uploaded))))
            .count())
    }

    /// Periodically push `.uploaded` files that no request scheduled, such
    /// as those left when a push task died. Files younger than one interval
    /// are left to their own upload.
    pub async fn run_sweeper(self) {
        let interval = self.inner.settings.sweep_interval;
        loop {
            tokio::time::sleep(interval).await;
            let entries = match self.inner.cache.walk().await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(error = %e, "unable to walk cache for drain sweep");
                    continue;
                }
            };
            let now = SystemTime::now();
            for entry in entries {
                let Some((connector, CacheState::Uploaded)) = CacheState::parse(&entry.name) else {
                    continue;
                };
                let age = now.duration_since(entry.modified).unwrap_or_default();
                if age >= interval && self.schedule_push(connector).is_some() {
                    info!(connector, "sweeping undrained upload");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::blobstore::{BlobResult, OpendalBlobStore, memory_operator};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// Memory store that counts downloads and can fail the first N calls.
    struct Flaky {
        inner: OpendalBlobStore,
        downloads: AtomicU32,
        uploads: AtomicU32,
        fail_downloads: u32,
        fail_uploads: u32,
        download_delay: Duration,
    }

    impl Flaky {
        fn new(fail_downloads: u32, fail_uploads: u32) -> Self {
            Self {
                inner: OpendalBlobStore::new(memory_operator().unwrap(), "memory"),
                downloads: AtomicU32::new(0),
                uploads: AtomicU32::new(0),
                fail_downloads,
                fail_uploads,
                download_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl BlobStore for Flaky {
        async fn upload(&self, key: &str, src: &mut (dyn AsyncRead + Send + Unpin)) -> BlobResult<u64> {
            let n = self.uploads.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_uploads {
                return Err(std::io::Error::other("injected upload failure").into());
            }
            self.inner.upload(key, src).await
        }

        async fn download(
            &self,
            key: &str,
            dst: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> BlobResult<u64> {
            let n = self.downloads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.download_delay).await;
            if n < self.fail_downloads {
                dst.write_all(b"partial").await?;
                return Err(std::io::Error::other("injected download failure").into());
            }
            self.inner.download(key, dst).await
        }

        async fn read(&self, key: &str) -> BlobResult<Option<Vec<u8>>> {
            self.inner.read(key).await
        }

        async fn write(&self, key: &str, data: Vec<u8>) -> BlobResult<()> {
            self.inner.write(key, data).await
        }

        async fn delete(&self, key: &str) -> BlobResult<()> {
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &str) -> BlobResult<bool> {
            self.inner.exists(key).await
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn fast_settings() -> DrainSettings {
        DrainSettings {
            workers: 2,
            push_attempts: 3,
            push_backoff: Duration::from_millis(5),
            pull_attempts: 22,
            pull_unit: Duration::from_millis(5),
            pull_budget: Duration::from_millis(500),
            stall_initial: Duration::from_millis(5),
            stall_max: Duration::from_millis(40),
            sweep_interval: Duration::from_millis(50),
        }
    }

    async fn provider(store: Arc<Flaky>) -> (DrainProvider, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheFs::open(dir.path()).await.unwrap();
        let (perf, _task) = PerformanceHandle::spawn();
        (DrainProvider::new(cache, store, fast_settings(), perf), dir)
    }

    async fn write_uploaded(cache: &CacheFs, connector: &str, body: &[u8]) {
        let mut f = cache
            .create(&CacheState::Uploaded.file_name(connector))
            .await
            .unwrap();
        f.write_all(body).await.unwrap();
    }

    async fn read_cached(cache: &CacheFs, connector: &str) -> Vec<u8> {
        let mut f = cache
            .open_file(&CacheState::Cached.file_name(connector))
            .await
            .unwrap();
        let mut out = Vec::new();
        f.read_to_end(&mut out).await.unwrap();
        out
    }

    #[test]
    fn test_pull_delays_are_fibonacci_within_budget() {
        let unit = Duration::from_secs(1);
        let delays = pull_delays(unit, 22, Duration::from_secs(120));
        let secs: Vec<u64> = delays.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![1, 1, 2, 3, 5, 8, 13, 21, 34]);
        assert!(delays.iter().sum::<Duration>() <= Duration::from_secs(120));

        let capped = pull_delays(unit, 4, Duration::from_secs(120));
        assert_eq!(capped.len(), 3);
    }

    #[tokio::test]
    async fn test_push_renames_to_cached() {
        let store = Arc::new(Flaky::new(0, 1));
        let (drain, _dir) = provider(store.clone()).await;
        write_uploaded(drain.cache(), "c1", b"ciphertext").await;

        drain.push_with_retries("c1").await.unwrap();
        assert_eq!(store.uploads.load(Ordering::SeqCst), 2);
        assert!(!drain.cache().exists("c1.uploaded").await.unwrap());
        assert_eq!(read_cached(drain.cache(), "c1").await, b"ciphertext");
        assert_eq!(store.read("c1").await.unwrap(), Some(b"ciphertext".to_vec()));
    }

    #[tokio::test]
    async fn test_push_gives_up_after_three_attempts() {
        let store = Arc::new(Flaky::new(0, 10));
        let (drain, _dir) = provider(store.clone()).await;
        write_uploaded(drain.cache(), "c2", b"x").await;

        let err = drain.push_with_retries("c2").await.unwrap_err();
        assert!(matches!(err, DrainError::PushFailed { attempts: 3, .. }));
        assert_eq!(store.uploads.load(Ordering::SeqCst), 3);
        assert!(drain.cache().walk().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_misses_fetch_once() {
        let mut flaky = Flaky::new(0, 0);
        flaky.download_delay = Duration::from_millis(50);
        let store = Arc::new(flaky);
        store.write("c3", b"remote ciphertext".to_vec()).await.unwrap();
        let (drain, _dir) = provider(store.clone()).await;

        let a = drain.clone();
        let b = drain.clone();
        let (ra, rb) = tokio::join!(a.open_ciphertext("c3"), b.open_ciphertext("c3"));
        assert_eq!(ra.unwrap().1, CacheState::Cached);
        assert_eq!(rb.unwrap().1, CacheState::Cached);
        assert_eq!(store.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(read_cached(drain.cache(), "c3").await, b"remote ciphertext");
    }

    #[tokio::test]
    async fn test_pull_retries_then_succeeds() {
        let store = Arc::new(Flaky::new(2, 0));
        store.write("c4", b"abc".to_vec()).await.unwrap();
        let (drain, _dir) = provider(store.clone()).await;

        let (_file, state) = drain.open_ciphertext("c4").await.unwrap();
        assert_eq!(state, CacheState::Cached);
        assert_eq!(store.downloads.load(Ordering::SeqCst), 3);
        assert_eq!(read_cached(drain.cache(), "c4").await, b"abc");
        assert!(!drain.cache().exists("c4.caching").await.unwrap());
    }

    #[tokio::test]
    async fn test_pull_of_missing_blob_fails_and_cleans_up() {
        let store = Arc::new(Flaky::new(0, 0));
        let (drain, _dir) = provider(store).await;

        let err = drain.open_ciphertext("ghost").await.unwrap_err();
        assert!(matches!(err, DrainError::PullFailed { .. }));
        assert!(drain.cache().walk().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_promotion_releases_caching_lock() {
        let store = Arc::new(Flaky::new(0, 0));
        store.write("c6", b"remote".to_vec()).await.unwrap();
        let (drain, dir) = provider(store).await;
        // a non-empty directory in the way makes the rename fail
        std::fs::create_dir(dir.path().join("c6.cached")).unwrap();
        std::fs::write(dir.path().join("c6.cached").join("x"), b"x").unwrap();

        let file = drain.cache().create("c6.caching").await.unwrap();
        let err = drain.pull("c6", file).await.unwrap_err();
        assert!(matches!(err, DrainError::Cache(_)));
        assert!(!drain.cache().exists("c6.caching").await.unwrap());
    }

    #[tokio::test]
    async fn test_uploaded_is_served_and_drained() {
        let store = Arc::new(Flaky::new(0, 0));
        let (drain, _dir) = provider(store.clone()).await;
        write_uploaded(drain.cache(), "c5", b"fresh").await;

        let (_file, state) = drain.open_ciphertext("c5").await.unwrap();
        assert_eq!(state, CacheState::Uploaded);
        for _ in 0..100 {
            if drain.cache().exists("c5.cached").await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(read_cached(drain.cache(), "c5").await, b"fresh");
        assert_eq!(store.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_recover_on_startup() {
        let store = Arc::new(Flaky::new(0, 0));
        let (drain, _dir) = provider(store.clone()).await;
        let cache = drain.cache().clone();
        write_uploaded(&cache, "up", b"u").await;
        cache.create("half.caching").await.unwrap();
        cache.create("gone.uploading").await.unwrap();
        cache.create("keep.cached").await.unwrap();

        let stats = drain.recover_on_startup().await.unwrap();
        assert_eq!(
            stats,
            RecoveryStats {
                pushes_scheduled: 1,
                partials_removed: 2
            }
        );
        for _ in 0..100 {
            if drain.count_uploaded().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut names: Vec<String> = cache.walk().await.unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, vec!["keep.cached".to_string(), "up.cached".to_string()]);
    }
}
