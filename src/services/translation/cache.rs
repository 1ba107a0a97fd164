use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::core::types::CloudModel;
use crate::utils::{Clock, Metrics};

/// Four-part identity of a cached translation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub source_text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub model: CloudModel,
}

impl CacheKey {
    pub fn new(source_text: &str, source_lang: &str, target_lang: &str, model: CloudModel) -> Self {
        Self {
            source_text: source_text.to_string(),
            source_lang: source_lang.to_string(),
            target_lang: target_lang.to_string(),
            model,
        }
    }

    fn encoded_len(&self) -> usize {
        self.source_text.len()
            + self.source_lang.len()
            + self.target_lang.len()
            + self.model.provider_id().len()
    }
}

/// A cached translation. Replaced as a whole, never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub translated_text: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: u64,
}

/// Translation cache with TTL expiry and debounced JSON persistence.
///
/// - Keys are xxHash3 digests of the four-part key (the full key is kept in
///   the entry and checked on lookup)
/// - Expired entries are misses, but only `purge_*` deletes them
/// - Persistence runs in a background task and only writes when dirty
#[derive(Clone)]
pub struct TranslationCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    ttl_days: RwLock<u32>,
    clock: Arc<dyn Clock>,
    cache_file: Option<PathBuf>,

    // Debounced persistence
    dirty: AtomicBool,
    save_notify: Notify,

    stats_tx: watch::Sender<CacheStats>,
    metrics: Option<Metrics>,
}

impl TranslationCache {
    /// In-memory cache
    pub fn new(ttl_days: u32, clock: Arc<dyn Clock>, metrics: Option<Metrics>) -> Self {
        Self::build(ttl_days, clock, None, HashMap::new(), metrics)
    }

    /// Cache backed by `<cache_dir>/translations.json`.
    ///
    /// # Arguments
    /// * `cache_dir` - Directory to store the cache file (created if missing)
    /// * `ttl_days` - Age after which entries stop being hits
    /// * `clock` - Time source for entry ages
    /// * `metrics` - Optional metrics collector
    pub async fn persistent(
        cache_dir: &str,
        ttl_days: u32,
        clock: Arc<dyn Clock>,
        metrics: Option<Metrics>,
    ) -> Result<Self> {
        let cache_path = Path::new(cache_dir);
        if !cache_path.exists() {
            tokio::fs::create_dir_all(cache_path)
                .await
                .context("Failed to create cache directory")?;
        }

        let cache_file = cache_path.join("translations.json");

        let loaded: Vec<CacheEntry> = if cache_file.exists() {
            let data = tokio::fs::read_to_string(&cache_file)
                .await
                .context("Failed to read cache file")?;
            serde_json::from_str(&data).unwrap_or_else(|e| {
                warn!("Discarding unreadable translation cache: {}", e);
                Vec::new()
            })
        } else {
            Vec::new()
        };

        let entries: HashMap<String, Arc<CacheEntry>> = loaded
            .into_iter()
            .map(|entry| (Self::generate_key(&entry.key), Arc::new(entry)))
            .collect();

        info!(
            "Loaded {} cached translations from {}",
            entries.len(),
            cache_file.display()
        );

        Ok(Self::build(ttl_days, clock, Some(cache_file), entries, metrics))
    }

    fn build(
        ttl_days: u32,
        clock: Arc<dyn Clock>,
        cache_file: Option<PathBuf>,
        entries: HashMap<String, Arc<CacheEntry>>,
        metrics: Option<Metrics>,
    ) -> Self {
        let stats = compute_stats(&entries);
        if let Some(ref m) = metrics {
            m.update_cache_size(stats.total_entries);
        }
        let (stats_tx, _) = watch::channel(stats);

        Self {
            inner: Arc::new(CacheInner {
                entries: RwLock::new(entries),
                ttl_days: RwLock::new(ttl_days),
                clock,
                cache_file,
                dirty: AtomicBool::new(false),
                save_notify: Notify::new(),
                stats_tx,
                metrics,
            }),
        }
    }

    /// xxHash3 digest of the four key parts as a hex string
    pub fn generate_key(key: &CacheKey) -> String {
        let mut hash_input = Vec::with_capacity(key.encoded_len() + 4);
        for part in [
            key.source_text.as_str(),
            key.source_lang.as_str(),
            key.target_lang.as_str(),
            key.model.provider_id(),
        ] {
            hash_input.extend_from_slice(part.as_bytes());
            // Separator keeps ("ab", "c") and ("a", "bc") apart
            hash_input.push(0x1f);
        }
        format!("{:016x}", xxh3_64(&hash_input))
    }

    pub fn ttl_days(&self) -> u32 {
        *self.inner.ttl_days.read()
    }

    pub fn set_ttl_days(&self, days: u32) {
        *self.inner.ttl_days.write() = days;
    }

    /// Live entry for the key, or None when absent or older than the TTL
    pub fn lookup(
        &self,
        source_text: &str,
        source_lang: &str,
        target_lang: &str,
        model: CloudModel,
    ) -> Option<Arc<CacheEntry>> {
        let key = CacheKey::new(source_text, source_lang, target_lang, model);
        let digest = Self::generate_key(&key);
        let ttl = ChronoDuration::days(i64::from(self.ttl_days()));
        let now = self.inner.clock.now();

        let hit = {
            let entries = self.inner.entries.read();
            entries
                .get(&digest)
                .filter(|entry| entry.key == key && now - entry.created_at <= ttl)
                .cloned()
        };

        if let Some(ref m) = self.inner.metrics {
            if hit.is_some() {
                m.record_cache_hit();
            } else {
                m.record_cache_miss();
            }
        }

        hit
    }

    /// Insert or overwrite the entry for this key
    pub fn store(
        &self,
        source_text: &str,
        source_lang: &str,
        target_lang: &str,
        model: CloudModel,
        translated_text: &str,
    ) -> Arc<CacheEntry> {
        let key = CacheKey::new(source_text, source_lang, target_lang, model);
        let digest = Self::generate_key(&key);
        let entry = Arc::new(CacheEntry {
            size_bytes: key.encoded_len() + translated_text.len(),
            key,
            translated_text: translated_text.to_string(),
            created_at: self.inner.clock.now(),
        });

        {
            let mut entries = self.inner.entries.write();
            entries.insert(digest, Arc::clone(&entry));
            self.changed(&entries);
        }

        entry
    }

    /// Drop a single key. Returns whether it was present.
    pub fn invalidate(
        &self,
        source_text: &str,
        source_lang: &str,
        target_lang: &str,
        model: CloudModel,
    ) -> bool {
        let digest =
            Self::generate_key(&CacheKey::new(source_text, source_lang, target_lang, model));
        let mut entries = self.inner.entries.write();
        let removed = entries.remove(&digest).is_some();
        if removed {
            self.changed(&entries);
        }
        removed
    }

    /// Remove everything. Returns the number of entries removed.
    pub fn clear_all(&self) -> usize {
        let mut entries = self.inner.entries.write();
        let removed = entries.len();
        entries.clear();
        self.changed(&entries);
        info!("Translation cache cleared ({} entries)", removed);
        removed
    }

    /// Remove entries older than `days`. Returns the number removed.
    pub fn purge_older_than(&self, days: u32) -> usize {
        let max_age = ChronoDuration::days(i64::from(days));
        let now = self.inner.clock.now();

        let mut entries = self.inner.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now - entry.created_at <= max_age);
        let removed = before - entries.len();

        if removed > 0 {
            self.changed(&entries);
        }
        debug!("Purged {} translations older than {} days", removed, days);
        removed
    }

    /// TTL sweep with the configured expiry
    pub fn purge_expired(&self) -> usize {
        self.purge_older_than(self.ttl_days())
    }

    pub fn stats(&self) -> CacheStats {
        compute_stats(&self.inner.entries.read())
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<CacheStats> {
        self.inner.stats_tx.subscribe()
    }

    fn changed(&self, entries: &HashMap<String, Arc<CacheEntry>>) {
        let stats = compute_stats(entries);
        self.inner.stats_tx.send_replace(stats);
        if let Some(ref m) = self.inner.metrics {
            m.update_cache_size(stats.total_entries);
        }
        self.inner.dirty.store(true, Ordering::Release);
        self.inner.save_notify.notify_one();
    }

    /// Write the cache file now (no-op for in-memory caches)
    pub async fn save(&self) -> Result<()> {
        Self::write_file(&self.inner).await
    }

    async fn write_file(inner: &CacheInner) -> Result<()> {
        let Some(ref cache_file) = inner.cache_file else {
            return Ok(());
        };

        let snapshot: Vec<CacheEntry> = {
            let entries = inner.entries.read();
            entries.values().map(|e| e.as_ref().clone()).collect()
        };
        // Clear before writing so changes made during the write stay dirty
        inner.dirty.store(false, Ordering::Release);

        let json = serde_json::to_string(&snapshot).context("Failed to serialize cache")?;
        if let Err(e) = tokio::fs::write(cache_file, json).await {
            inner.dirty.store(true, Ordering::Release);
            return Err(e).context("Failed to write cache file");
        }
        Ok(())
    }

    /// Persist dirty state at most once per `interval` until `shutdown`
    /// fires; a final save happens on shutdown.
    pub fn start_persistence_task(
        &self,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if self.inner.cache_file.is_none() || interval.is_zero() {
            return None;
        }
        let inner = Arc::clone(&self.inner);

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = inner.save_notify.notified() => {}
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                if inner.dirty.load(Ordering::Acquire) {
                    if let Err(e) = Self::write_file(&inner).await {
                        warn!("Background cache save failed: {:#}", e);
                    }
                }
            }

            if inner.dirty.load(Ordering::Acquire) {
                if let Err(e) = Self::write_file(&inner).await {
                    warn!("Final cache save failed: {:#}", e);
                }
            }
        }))
    }
}

fn compute_stats(entries: &HashMap<String, Arc<CacheEntry>>) -> CacheStats {
    CacheStats {
        total_entries: entries.len(),
        total_size_bytes: entries.values().map(|e| e.size_bytes as u64).sum(),
    }
}
