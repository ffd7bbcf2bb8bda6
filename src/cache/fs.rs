//! Rooted, flat file store backing the ciphertext cache.

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};
use tokio::fs::{self, File, OpenOptions};
use tracing::debug;

use super::{CacheError, CacheResult, state::CacheState};

/// A regular file found while walking the cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub name: String,
    pub size: u64,
    pub modified: SystemTime,
}

/// Directory holding ciphertext files by name. Names are plain file names;
/// anything that could escape the root is rejected.
#[derive(Debug, Clone)]
pub struct CacheFs {
    root: PathBuf,
}

impl CacheFs {
    /// Open (and create if needed) the cache rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> CacheResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| CacheError::io(&root.display().to_string(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for `name`.
    pub fn resolve(&self, name: &str) -> CacheResult<PathBuf> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
            || name.contains('\0')
        {
            return Err(CacheError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }

    pub fn path_for(&self, connector: &str, state: CacheState) -> CacheResult<PathBuf> {
        self.resolve(&state.file_name(connector))
    }

    pub async fn open_file(&self, name: &str) -> CacheResult<File> {
        let path = self.resolve(name)?;
        File::open(&path).await.map_err(|e| CacheError::io(name, e))
    }

    /// Create `name`, failing if it already exists.
    pub async fn create(&self, name: &str) -> CacheResult<File> {
        let path = self.resolve(name)?;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| CacheError::io(name, e))
    }

    /// Open `name` for writing from the start, truncating what is there.
    pub async fn rewrite(&self, name: &str) -> CacheResult<File> {
        let path = self.resolve(name)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| CacheError::io(name, e))
    }

    /// Metadata for `name`, or `None` if absent.
    pub async fn stat(&self, name: &str) -> CacheResult<Option<std::fs::Metadata>> {
        let path = self.resolve(name)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(name, e)),
        }
    }

    pub async fn exists(&self, name: &str) -> CacheResult<bool> {
        Ok(self.stat(name).await?.is_some())
    }

    /// Atomic rename within the root.
    pub async fn rename(&self, from: &str, to: &str) -> CacheResult<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        fs::rename(&src, &dst)
            .await
            .map_err(|e| CacheError::io(from, e))?;
        debug!(from, to, "cache rename");
        Ok(())
    }

    /// Remove `name`. Missing files are not an error.
    pub async fn remove(&self, name: &str) -> CacheResult<()> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(name, "cache remove");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::io(name, e)),
        }
    }

    /// Drop every file in the cache, keeping the root.
    pub async fn remove_all(&self) -> CacheResult<()> {
        for entry in self.walk().await? {
            self.remove(&entry.name).await?;
        }
        Ok(())
    }

    /// Shrink `name` to zero bytes.
    pub async fn truncate(&self, name: &str) -> CacheResult<()> {
        let path = self.resolve(name)?;
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| CacheError::io(name, e))?;
        file.set_len(0).await.map_err(|e| CacheError::io(name, e))
    }

    /// Set the modification time of `name`.
    pub async fn chtimes(&self, name: &str, when: SystemTime) -> CacheResult<()> {
        let path = self.resolve(name)?;
        let owned = name.to_string();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new().write(true).open(&path)?;
            file.set_modified(when)
        })
        .await
        .map_err(|e| CacheError::io(&owned, std::io::Error::other(e)))?
        .map_err(|e| CacheError::io(&owned, e))
    }

    /// Regular files directly under the root.
    pub async fn walk(&self) -> CacheResult<Vec<CacheEntry>> {
        let root_name = self.root.display().to_string();
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| CacheError::io(&root_name, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| CacheError::io(&root_name, e))?
        {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            entries.push(CacheEntry {
                name,
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(entries)
    }
}
