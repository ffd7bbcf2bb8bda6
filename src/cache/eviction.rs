//! Background eviction of cached ciphertext.
//!
//! Keeps disk usage between two watermarks. A cached file's worth is
//! `size / age²`: large files survive longer, but age dominates, so anything
//! not read recently becomes a candidate quickly. Reads refresh mtime.

use std::{
    io,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant, SystemTime},
};
use tracing::{debug, error, info, warn};

use super::{CacheResult, fs::CacheFs, state::CacheState};

/// Non-cached files older than this are garbage.
pub const STALE_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Fraction of the filesystem in use, `0.0..=1.0`.
pub trait DiskUsage: Send + Sync {
    fn usage(&self, path: &Path) -> io::Result<f64>;
}

/// Usage from `statvfs`: `1 - available / total` blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsUsage;

impl DiskUsage for StatvfsUsage {
    fn usage(&self, path: &Path) -> io::Result<f64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        let blocks = stat.blocks() as f64;
        if blocks == 0.0 {
            return Ok(0.0);
        }
        Ok(1.0 - stat.blocks_available() as f64 / blocks)
    }
}

#[derive(Debug, Clone)]
pub struct EvictionSettings {
    pub low_watermark: f64,
    pub high_watermark: f64,
    pub age_eligible: Duration,
    pub walk_sleep: Duration,
}

impl Default for EvictionSettings {
    fn default() -> Self {
        Self {
            low_watermark: 0.50,
            high_watermark: 0.75,
            age_eligible: Duration::from_secs(300),
            walk_sleep: Duration::from_secs(30),
        }
    }
}

/// What to do with one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Retain,
    Evict,
    RemoveStale,
}

/// Decide the fate of a file. `state` is `None` for names the cache does
/// not recognise; `age` is time since last modification.
pub fn judge(
    state: Option<CacheState>,
    size: u64,
    age: Duration,
    usage: f64,
    settings: &EvictionSettings,
) -> Verdict {
    if state != Some(CacheState::Cached) {
        return if age > STALE_AGE {
            Verdict::RemoveStale
        } else {
            Verdict::Retain
        };
    }
    if usage < settings.low_watermark {
        return Verdict::Retain;
    }
    let age_secs = age.as_secs().max(1);
    let value = size / age_secs.saturating_mul(age_secs);
    let old_enough = age > settings.age_eligible;
    if usage > settings.high_watermark && old_enough {
        Verdict::Evict
    } else if old_enough && usage > settings.low_watermark && value == 0 {
        Verdict::Evict
    } else {
        Verdict::Retain
    }
}

/// Totals for one walk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionStats {
    pub usage: f64,
    pub reviewed: u64,
    pub reviewed_bytes: u64,
    pub evicted: u64,
    pub evicted_bytes: u64,
    pub errors: u64,
    pub error_bytes: u64,
    pub elapsed: Duration,
}

impl EvictionStats {
    pub fn render(&self) -> String {
        format!(
            "usage\treviewed\treviewed_bytes\tevicted\tevicted_bytes\terrors\terror_bytes\telapsed_ms\n{:.3}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
            self.usage,
            self.reviewed,
            self.reviewed_bytes,
            self.evicted,
            self.evicted_bytes,
            self.errors,
            self.error_bytes,
            self.elapsed.as_millis()
        )
    }
}

pub struct CacheEvictor {
    cache: CacheFs,
    disk: Arc<dyn DiskUsage>,
    settings: EvictionSettings,
    last: Mutex<Option<EvictionStats>>,
}

impl CacheEvictor {
    pub fn new(cache: CacheFs, disk: Arc<dyn DiskUsage>, settings: EvictionSettings) -> Self {
        Self {
            cache,
            disk,
            settings,
            last: Mutex::new(None),
        }
    }

    pub fn last_stats(&self) -> Option<EvictionStats> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Measure usage and walk once.
    pub async fn run_once(&self) -> CacheResult<EvictionStats> {
        let usage = self
            .disk
            .usage(self.cache.root())
            .map_err(|e| super::CacheError::io(&self.cache.root().display().to_string(), e))?;
        let stats = self.sweep(usage).await?;
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(stats.clone());
        Ok(stats)
    }

    /// Walk the cache once at the given usage level.
    pub async fn sweep(&self, usage: f64) -> CacheResult<EvictionStats> {
        let started = Instant::now();
        let now = SystemTime::now();
        let mut stats = EvictionStats {
            usage,
            ..EvictionStats::default()
        };

        for entry in self.cache.walk().await? {
            stats.reviewed += 1;
            stats.reviewed_bytes += entry.size;
            let age = now.duration_since(entry.modified).unwrap_or_default();
            let state = CacheState::parse(&entry.name).map(|(_, state)| state);

            let verdict = judge(state, entry.size, age, usage, &self.settings);
            if verdict == Verdict::Retain {
                continue;
            }
            match self.cache.remove(&entry.name).await {
                Ok(()) => {
                    stats.evicted += 1;
                    stats.evicted_bytes += entry.size;
                    if verdict == Verdict::RemoveStale {
                        warn!(file = %entry.name, age_secs = age.as_secs(), "removed stale cache file");
                    } else {
                        info!(file = %entry.name, age_secs = age.as_secs(), size = entry.size, usage, "evicted");
                    }
                }
                Err(e) => {
                    stats.errors += 1;
                    stats.error_bytes += entry.size;
                    error!(file = %entry.name, error = %e, "unable to evict; truncating");
                    if let Err(e) = self.cache.truncate(&entry.name).await {
                        error!(file = %entry.name, error = %e, "unable to truncate");
                    }
                }
            }
        }

        stats.elapsed = started.elapsed();
        debug!(
            usage,
            reviewed = stats.reviewed,
            evicted = stats.evicted,
            errors = stats.errors,
            "eviction walk done"
        );
        Ok(stats)
    }

    /// Loop forever, one walk per `walk_sleep`.
    pub async fn run(self: Arc<Self>) {
        info!(
            low = self.settings.low_watermark,
            high = self.settings.high_watermark,
            "cache eviction started"
        );
        loop {
            if let Err(e) = self.run_once().await {
                error!(error = %e, "cache eviction walk failed");
            }
            tokio::time::sleep(self.settings.walk_sleep).await;
        }
    }
}
