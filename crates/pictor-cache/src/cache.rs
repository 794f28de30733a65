//! Size-bounded generation cache
//!
//! Maps request fingerprints to validated images on disk:
//!
//! ```text
//! <dir>/<fingerprint>.<ext>    encoded image
//! <dir>/<fingerprint>.json     CacheEntry sidecar
//! ```
//!
//! Recency is an insertion-ordered map: a hit moves the entry to the back
//! and eviction pops from the front until the total size fits the budget.
//! All mutation goes through one async lock, so size accounting is
//! serialized.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use pictor_artifact::{ContentHash, Fingerprint, ImageArtifact, MediaType};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::CacheError;

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// A disabled cache always misses and never stores
    pub enabled: bool,
    pub directory: PathBuf,
    /// Budget over the sum of image sizes
    pub max_size_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from(".pictor/cache"),
            max_size_bytes: 512 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Enabled cache rooted at `directory`
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>, max_size_bytes: u64) -> Self {
        Self {
            enabled: true,
            directory: directory.into(),
            max_size_bytes,
        }
    }

    /// Disabled cache
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// One cached generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub image_hash: ContentHash,
    pub media_type: MediaType,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Opaque caller data (prompt used, critique, provider metadata)
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl CacheEntry {
    fn image_file_name(&self) -> String {
        format!("{}.{}", self.fingerprint, self.media_type.extension())
    }
}

/// A cache hit
#[derive(Debug, Clone)]
pub struct CachedImage {
    pub entry: CacheEntry,
    pub image: ImageArtifact,
    pub path: PathBuf,
}

/// Result of a [`GenerationCache::store`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Written; `evicted` older entries were removed to make room
    Stored { path: PathBuf, evicted: usize },
    /// An entry for this fingerprint already exists and was kept
    AlreadyPresent { path: PathBuf },
    /// Cache is disabled
    Disabled,
}

impl StoreOutcome {
    /// Path of the cached image, if any
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            StoreOutcome::Stored { path, .. } | StoreOutcome::AlreadyPresent { path } => {
                Some(path)
            }
            StoreOutcome::Disabled => None,
        }
    }
}

/// Statistics for cache monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    // front = least recently accessed
    entries: IndexMap<Fingerprint, CacheEntry>,
    total_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Disk-backed LRU cache from [`Fingerprint`] to image
#[derive(Debug)]
pub struct GenerationCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl GenerationCache {
    /// Open (or create) the cache directory and rebuild the index from
    /// sidecars. Entries whose image is missing or unreadable are dropped,
    /// as are interrupted writes and images without a sidecar. The budget
    /// is enforced before returning.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created or listed
    pub async fn open(config: CacheConfig) -> Result<Self, CacheError> {
        if !config.enabled {
            return Ok(Self::disabled());
        }
        let dir = config.directory.clone();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::io(&dir, e))?;

        let mut loaded = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| CacheError::io(&dir, e))?;
        while let Some(item) = reader
            .next_entry()
            .await
            .map_err(|e| CacheError::io(&dir, e))?
        {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_sidecar(&dir, &path).await {
                Ok(entry) => loaded.push(entry),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "dropping unreadable cache entry");
                    remove_quietly(&path).await;
                }
            }
        }
        loaded.sort_by_key(|e| e.last_accessed_at);

        let mut state = CacheState::default();
        for entry in loaded {
            state.total_bytes += entry.size_bytes;
            state.entries.insert(entry.fingerprint, entry);
        }
        let swept = sweep_orphans(&dir, &state).await?;

        let cache = Self {
            config,
            state: Mutex::new(state),
        };
        let evicted = cache.evict_if_over_budget().await;
        let stats = cache.stats().await;
        info!(
            dir = %dir.display(),
            entries = stats.entries,
            bytes = stats.total_bytes,
            evicted,
            swept,
            "cache opened"
        );
        Ok(cache)
    }

    /// Cache that always misses
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            config: CacheConfig::disabled(),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Whether lookups and stores do anything
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a fingerprint, marking the entry most recently used.
    ///
    /// An entry whose image is gone or no longer matches its hash is
    /// removed and reported as a miss.
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CachedImage> {
        if !self.config.enabled {
            return None;
        }
        let mut state = self.state.lock().await;

        let Some(entry) = state.entries.get(fingerprint).cloned() else {
            state.misses += 1;
            debug!(fingerprint = %fingerprint.short(), "cache miss");
            return None;
        };

        let path = self.config.directory.join(entry.image_file_name());
        let image = match tokio::fs::read(&path).await {
            Ok(bytes) => ImageArtifact::from_bytes_verified(bytes, &entry.image_hash)
                .map_err(CacheError::from),
            Err(e) => Err(CacheError::io(&path, e)),
        };
        let image = match image {
            Ok(image) => image,
            Err(e) => {
                warn!(fingerprint = %fingerprint.short(), error = %e, "dropping corrupt cache entry");
                self.remove_locked(&mut state, fingerprint).await;
                state.misses += 1;
                return None;
            }
        };

        // touch: move to the most-recent end
        let mut entry = entry;
        entry.last_accessed_at = Utc::now();
        state.entries.shift_remove(fingerprint);
        state.entries.insert(*fingerprint, entry.clone());
        state.hits += 1;
        debug!(fingerprint = %fingerprint.short(), "cache hit");

        if let Err(e) = self.write_sidecar(&entry).await {
            warn!(fingerprint = %fingerprint.short(), error = %e, "failed to persist access time");
        }
        Some(CachedImage { entry, image, path })
    }

    /// Store an image under `fingerprint`, then evict least recently used
    /// entries until the total fits the budget.
    ///
    /// The first store of a fingerprint wins; later stores leave it in place.
    ///
    /// # Errors
    /// Returns [`CacheError::EntryTooLarge`] if the image alone exceeds the
    /// budget, or an I/O error if it cannot be written
    pub async fn store(
        &self,
        fingerprint: Fingerprint,
        image: &ImageArtifact,
        metadata: serde_json::Value,
    ) -> Result<StoreOutcome, CacheError> {
        if !self.config.enabled {
            return Ok(StoreOutcome::Disabled);
        }
        let budget = self.config.max_size_bytes;
        if image.size_bytes() > budget {
            return Err(CacheError::EntryTooLarge {
                size_bytes: image.size_bytes(),
                budget_bytes: budget,
            });
        }

        let mut state = self.state.lock().await;
        if let Some(existing) = state.entries.get(&fingerprint) {
            debug!(fingerprint = %fingerprint.short(), "cache entry already present");
            return Ok(StoreOutcome::AlreadyPresent {
                path: self.config.directory.join(existing.image_file_name()),
            });
        }

        let now = Utc::now();
        let entry = CacheEntry {
            fingerprint,
            image_hash: *image.hash(),
            media_type: image.media_type(),
            width: image.width(),
            height: image.height(),
            size_bytes: image.size_bytes(),
            created_at: now,
            last_accessed_at: now,
            metadata,
        };

        let path = self.config.directory.join(entry.image_file_name());
        write_atomic(&path, image.bytes()).await?;
        if let Err(e) = self.write_sidecar(&entry).await {
            remove_quietly(&path).await;
            return Err(e);
        }

        state.total_bytes += entry.size_bytes;
        state.entries.insert(fingerprint, entry);
        let evicted = self.evict_locked(&mut state).await;
        info!(
            fingerprint = %fingerprint.short(),
            bytes = image.size_bytes(),
            total_bytes = state.total_bytes,
            evicted,
            "cached image"
        );
        Ok(StoreOutcome::Stored { path, evicted })
    }

    /// Evict least recently used entries until the total size fits the
    /// budget. Returns the number evicted.
    pub async fn evict_if_over_budget(&self) -> usize {
        let mut state = self.state.lock().await;
        self.evict_locked(&mut state).await
    }

    /// Remove one entry. Returns whether it existed.
    pub async fn remove(&self, fingerprint: &Fingerprint) -> bool {
        let mut state = self.state.lock().await;
        self.remove_locked(&mut state, fingerprint).await
    }

    /// Remove every entry
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let keys: Vec<Fingerprint> = state.entries.keys().copied().collect();
        for fp in &keys {
            self.remove_locked(&mut state, fp).await;
        }
        info!(removed = keys.len(), "cache cleared");
        keys.len()
    }

    /// Current statistics
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            enabled: self.config.enabled,
            entries: state.entries.len(),
            total_bytes: state.total_bytes,
            budget_bytes: self.config.max_size_bytes,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    async fn evict_locked(&self, state: &mut CacheState) -> usize {
        let mut evicted = 0;
        while state.total_bytes > self.config.max_size_bytes {
            let Some(fp) = state.entries.first().map(|(k, _)| *k) else {
                break;
            };
            debug!(fingerprint = %fp.short(), "evicting least recently used entry");
            self.remove_locked(state, &fp).await;
            state.evictions += 1;
            evicted += 1;
        }
        evicted
    }

    async fn remove_locked(&self, state: &mut CacheState, fingerprint: &Fingerprint) -> bool {
        let Some(entry) = state.entries.shift_remove(fingerprint) else {
            return false;
        };
        state.total_bytes = state.total_bytes.saturating_sub(entry.size_bytes);
        remove_quietly(&self.config.directory.join(entry.image_file_name())).await;
        remove_quietly(&self.sidecar_path(fingerprint)).await;
        true
    }

    fn sidecar_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.config.directory.join(format!("{fingerprint}.json"))
    }

    async fn write_sidecar(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let json = serde_json::to_vec_pretty(entry)?;
        write_atomic(&self.sidecar_path(&entry.fingerprint), &json).await
    }
}

async fn load_sidecar(dir: &Path, path: &Path) -> Result<CacheEntry, CacheError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| CacheError::io(path, e))?;
    let entry: CacheEntry = serde_json::from_slice(&raw)?;
    let image_path = dir.join(entry.image_file_name());
    let meta = tokio::fs::metadata(&image_path)
        .await
        .map_err(|e| CacheError::io(&image_path, e))?;
    if meta.len() != entry.size_bytes {
        remove_quietly(&image_path).await;
        return Err(CacheError::io(
            &image_path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, "size does not match sidecar"),
        ));
    }
    Ok(entry)
}

/// Remove `*.tmp` leftovers and cache-named images no index entry owns
async fn sweep_orphans(dir: &Path, state: &CacheState) -> Result<usize, CacheError> {
    let owned: HashSet<String> = state
        .entries
        .values()
        .map(CacheEntry::image_file_name)
        .collect();
    let mut swept = 0;
    let mut reader = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| CacheError::io(dir, e))?;
    while let Some(item) = reader
        .next_entry()
        .await
        .map_err(|e| CacheError::io(dir, e))?
    {
        let path = item.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let orphan = if name.ends_with(".tmp") {
            true
        } else {
            let (stem, ext) = name.split_once('.').unwrap_or((name, ""));
            ext != "json" && stem.parse::<Fingerprint>().is_ok() && !owned.contains(name)
        };
        if orphan {
            debug!(path = %path.display(), "removing orphaned cache file");
            remove_quietly(&path).await;
            swept += 1;
        }
    }
    Ok(swept)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| CacheError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| CacheError::io(path, e))
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove cache file"),
    }
}
