//! Ciphertext file states and their suffixes.

/// Lifecycle state of a ciphertext file in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheState {
    /// Being written by an in-flight upload.
    Uploading,
    /// Complete locally, not yet in the blob store.
    Uploaded,
    /// Being fetched back from the blob store.
    Caching,
    /// Complete locally and durable in the blob store.
    Cached,
}

impl CacheState {
    pub const ALL: [CacheState; 4] = [
        CacheState::Uploading,
        CacheState::Uploaded,
        CacheState::Caching,
        CacheState::Cached,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            CacheState::Uploading => ".uploading",
            CacheState::Uploaded => ".uploaded",
            CacheState::Caching => ".caching",
            CacheState::Cached => ".cached",
        }
    }

    pub fn file_name(self, connector: &str) -> String {
        format!("{connector}{}", self.suffix())
    }

    /// Split a cache file name into connector and state.
    pub fn parse(file_name: &str) -> Option<(&str, CacheState)> {
        Self::ALL.iter().find_map(|state| {
            file_name
                .strip_suffix(state.suffix())
                .filter(|connector| !connector.is_empty())
                .map(|connector| (connector, *state))
        })
    }
}
