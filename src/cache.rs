//! A bounded, time-expiring translation cache shared by every pipeline worker.
//!
//! Entries live in a sharded concurrent map, so readers and writers touching
//! different keys rarely contend, and an age sweep only ever locks one shard
//! at a time. The whole map is periodically snapshotted to a JSON file so
//! that translations survive restarts.
//!
//! The cache is advisory. Anything that goes wrong with it (an unreadable
//! snapshot, a failed save) is logged and otherwise ignored, and the caller
//! simply pays for another call to the translation engine.

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{async_utils::io::write_file_atomically, prelude::*};

/// Name of the snapshot file inside the cache directory.
const SNAPSHOT_FILE_NAME: &str = "translations.json";

/// Default maximum number of entries.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Default age after which entries may be swept.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How many entries we keep after trimming a full cache, so that we don't
/// trim again on the very next insert.
fn low_water_mark(max_entries: usize) -> usize {
    (max_entries - max_entries / 10).max(1)
}

/// Collapse whitespace so that trivially different OCR output shares an entry.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Key identifying a cached translation.
#[derive(Clone, Debug, Deserialize, Hash, PartialEq, Eq, Serialize)]
pub struct CacheKey {
    /// Source text, already passed through [`normalize_text`].
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
}

impl CacheKey {
    /// Build a key, normalizing `text`.
    pub fn new(text: &str, source_lang: &str, target_lang: &str) -> Self {
        Self {
            text: normalize_text(text),
            source_lang: source_lang.to_owned(),
            target_lang: target_lang.to_owned(),
        }
    }
}

/// A cached translation and when it was last written.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct CacheValue {
    translated_text: String,
    written_at: DateTime<Utc>,
}

/// On-disk snapshot format.
#[derive(Debug, Default, Deserialize, Serialize)]
struct Snapshot {
    entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
struct SnapshotEntry {
    #[serde(flatten)]
    key: CacheKey,
    #[serde(flatten)]
    value: CacheValue,
}

/// Cache counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entries, {} hits, {} misses, {} writes, {} evictions",
            self.entries, self.hits, self.misses, self.writes, self.evictions
        )
    }
}

/// Translation cache. Cheap to clone; all clones share the same entries.
#[derive(Clone)]
pub struct TranslationCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    entries: DashMap<CacheKey, CacheValue>,
    max_entries: usize,
    /// Where we persist snapshots. `None` for purely in-memory caches.
    snapshot_path: Option<PathBuf>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    /// Held while trimming a full cache.
    sweep_lock: Mutex<()>,
}

impl TranslationCache {
    /// Create an empty, in-memory cache.
    pub fn in_memory(max_entries: usize) -> Self {
        Self::from_parts(DashMap::new(), max_entries, None)
    }

    /// Open the cache stored in `cache_dir`, creating the directory if needed.
    ///
    /// A missing snapshot is normal. A corrupt one is logged and discarded.
    #[instrument(level = "debug", skip_all, fields(cache_dir = %cache_dir.display()))]
    pub async fn open(cache_dir: &Path, max_entries: usize) -> Result<Self> {
        tokio::fs::create_dir_all(cache_dir)
            .await
            .with_context(|| format!("cannot create cache directory {:?}", cache_dir))?;
        let snapshot_path = cache_dir.join(SNAPSHOT_FILE_NAME);

        let entries = DashMap::new();
        match tokio::fs::read(&snapshot_path).await {
            Ok(data) => match serde_json::from_slice::<Snapshot>(&data) {
                Ok(snapshot) => {
                    for SnapshotEntry { key, value } in snapshot.entries {
                        entries.insert(key, value);
                    }
                }
                Err(err) => warn!(
                    path = %snapshot_path.display(),
                    "Ignoring unreadable translation cache: {}",
                    err
                ),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %snapshot_path.display(),
                "Ignoring translation cache we cannot read: {}",
                err
            ),
        }
        debug!(entries = entries.len(), "Loaded translation cache");

        let cache = Self::from_parts(entries, max_entries, Some(snapshot_path));
        cache.enforce_capacity();
        Ok(cache)
    }

    fn from_parts(
        entries: DashMap<CacheKey, CacheValue>,
        max_entries: usize,
        snapshot_path: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries,
                max_entries: max_entries.max(1),
                snapshot_path,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                writes: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                sweep_lock: Mutex::new(()),
            }),
        }
    }

    /// Look up a translation.
    pub fn get(&self, text: &str, source_lang: &str, target_lang: &str) -> Option<String> {
        let key = CacheKey::new(text, source_lang, target_lang);
        let found = self
            .inner
            .entries
            .get(&key)
            .map(|value| value.translated_text.clone());
        let counter = if found.is_some() {
            &self.inner.hits
        } else {
            &self.inner.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Store a translation, replacing any existing entry for the same key and
    /// refreshing its timestamp. Blank text is never stored.
    pub fn put(&self, text: &str, translated_text: &str, source_lang: &str, target_lang: &str) {
        self.put_at(text, translated_text, source_lang, target_lang, Utc::now());
    }

    fn put_at(
        &self,
        text: &str,
        translated_text: &str,
        source_lang: &str,
        target_lang: &str,
        written_at: DateTime<Utc>,
    ) {
        if text.trim().is_empty() {
            return;
        }
        let key = CacheKey::new(text, source_lang, target_lang);
        let value = CacheValue {
            translated_text: translated_text.to_owned(),
            written_at,
        };
        // `insert` locks the key's shard for the whole upsert, so two workers
        // racing on one key can't leave duplicates.
        self.inner.entries.insert(key, value);
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
        if self.inner.entries.len() > self.inner.max_entries {
            self.enforce_capacity();
        }
    }

    /// Remove every entry written at least `max_age` ago. Returns how many
    /// entries were removed.
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, value| value.written_at > cutoff);
        let removed = before.saturating_sub(self.inner.entries.len());
        self.inner
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            debug!(removed, "Evicted stale translations");
        }
        removed
    }

    /// If we're over capacity, drop the oldest entries until we're down to
    /// the low-water mark. Only one sweep runs at a time. Anybody else who
    /// finds the cache full while a sweep is running just carries on.
    fn enforce_capacity(&self) {
        let Ok(_sweeping) = self.inner.sweep_lock.try_lock() else {
            return;
        };
        let len = self.inner.entries.len();
        if len <= self.inner.max_entries {
            return;
        }
        let excess = len - low_water_mark(self.inner.max_entries);
        let mut by_age = self
            .inner
            .entries
            .iter()
            .map(|entry| (entry.value().written_at, entry.key().clone()))
            .collect::<Vec<_>>();
        by_age.sort_by(|a, b| a.0.cmp(&b.0));
        let mut removed = 0;
        for (_, key) in by_age.into_iter().take(excess) {
            if self.inner.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        debug!(removed, "Trimmed full translation cache");
        self.inner
            .evictions
            .fetch_add(removed, Ordering::Relaxed);
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.inner.entries.clear();
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.inner.entries.len(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            writes: self.inner.writes.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }

    /// Write a snapshot to disk. A no-op for in-memory caches.
    #[instrument(level = "debug", skip_all)]
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.inner.snapshot_path else {
            return Ok(());
        };
        let snapshot = Snapshot {
            entries: self
                .inner
                .entries
                .iter()
                .map(|entry| SnapshotEntry {
                    key: entry.key().clone(),
                    value: entry.value().clone(),
                })
                .collect(),
        };
        let json =
            serde_json::to_vec(&snapshot).context("cannot serialize translation cache")?;
        write_file_atomically(path, json).await?;
        debug!(entries = snapshot.entries.len(), "Saved translation cache");
        Ok(())
    }

    /// Save, logging instead of failing.
    pub async fn save_or_warn(&self) {
        if let Err(err) = self.save().await {
            warn!("Could not save translation cache: {:?}", err);
        }
    }

    /// Spawn a background task that sweeps entries older than `max_age` and
    /// saves a snapshot every `interval`, until `shutdown` is cancelled.
    pub fn spawn_maintenance(
        &self,
        interval: Duration,
        max_age: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.evict_older_than(max_age);
                        cache.save_or_warn().await;
                    }
                }
            }
        })
    }
}
