use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, ClearMode, ClearPolicy};
use crate::error::{Result, SkaldError};

/// Metadata persisted alongside each cached prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    /// RFC 3339 creation time
    pub created: String,
    /// RFC 3339 last access time (bumped on every `get`)
    pub last_accessed: String,
    pub size_bytes: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_ms: u64,
}

/// Restrict a server-assigned cache key to filesystem-safe characters.
/// Anything outside `[A-Za-z0-9_-]` is stripped before path construction.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// On-disk cache of server-provided audio prompts.
///
/// Each entry is a complete WAV file at `<dir>/<sanitized_key>.wav`; the
/// metadata index lives in `<dir>/metadata.json` and is rewritten atomically
/// (temp file then rename) so a crash leaves the previous index valid.
pub struct AudioCache {
    dir: PathBuf,
    max_size_mb: u64,
    entries: HashMap<String, CacheEntryMeta>,
}

impl AudioCache {
    /// Open (or create) the cache directory and apply the clear policy.
    pub fn open(config: &CacheConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.directory)?;

        let mut cache = Self {
            dir: config.directory.clone(),
            max_size_mb: config.max_size_mb,
            entries: HashMap::new(),
        };
        cache.entries = cache.load_metadata();

        match &config.clear_policy {
            ClearPolicy::Mode(ClearMode::OnStart) => {
                info!("Clearing audio cache (policy: on_start)");
                cache.clear_all();
            }
            ClearPolicy::TtlHours(hours) if *hours > 0.0 => {
                cache.clear_expired(*hours);
            }
            _ => {}
        }

        if cache.max_size_mb > 0 {
            cache.enforce_size_limit();
        }

        info!(
            "Audio cache ready: {} ({} items)",
            cache.dir.display(),
            cache.entries.len()
        );
        Ok(cache)
    }

    fn wav_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.wav", sanitize_key(key)))
    }

    fn metadata_path(&self) -> PathBuf {
        self.dir.join("metadata.json")
    }

    /// Check whether a key exists with its backing file intact. A missing
    /// file drops the stale metadata entry.
    pub fn has(&mut self, key: &str) -> bool {
        let key = sanitize_key(key);
        if !self.entries.contains_key(&key) {
            return false;
        }
        if !self.wav_path(&key).exists() {
            self.entries.remove(&key);
            self.save_metadata();
            return false;
        }
        true
    }

    /// Retrieve cached audio, bumping its last-access time.
    pub fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        if !self.has(key) {
            return None;
        }
        let key = sanitize_key(key);
        match std::fs::read(self.wav_path(&key)) {
            Ok(data) => {
                if let Some(meta) = self.entries.get_mut(&key) {
                    meta.last_accessed = chrono::Utc::now().to_rfc3339();
                }
                self.save_metadata();
                Some(data)
            }
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    /// Store audio under a key, replacing any previous entry.
    pub fn store(
        &mut self,
        key: &str,
        data: &[u8],
        sample_rate: u32,
        channels: u16,
        duration_ms: u64,
    ) -> Result<()> {
        let key = sanitize_key(key);
        if key.is_empty() {
            return Err(SkaldError::Cache(
                "cache key empty after sanitization".to_string(),
            ));
        }

        std::fs::write(self.wav_path(&key), data)?;

        let now = chrono::Utc::now().to_rfc3339();
        self.entries.insert(
            key.clone(),
            CacheEntryMeta {
                created: now.clone(),
                last_accessed: now,
                size_bytes: data.len() as u64,
                sample_rate,
                channels,
                duration_ms,
            },
        );
        self.save_metadata();

        debug!(
            "Cached {}: {}B, {}ms @ {}Hz",
            key,
            data.len(),
            duration_ms,
            sample_rate
        );

        if self.max_size_mb > 0 {
            self.enforce_size_limit();
        }
        Ok(())
    }

    /// Metadata for a cached item, if present.
    pub fn info(&self, key: &str) -> Option<&CacheEntryMeta> {
        self.entries.get(&sanitize_key(key))
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Remove all cached files and reset the index.
    pub fn clear_all(&mut self) {
        for key in self.entries.keys() {
            let path = self.dir.join(format!("{}.wav", key));
            if let Err(e) = std::fs::remove_file(&path) {
                if path.exists() {
                    warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
        self.entries.clear();
        self.save_metadata();
    }

    fn load_metadata(&self) -> HashMap<String, CacheEntryMeta> {
        let path = self.metadata_path();
        if !path.exists() {
            return HashMap::new();
        }
        match std::fs::read_to_string(&path)
            .map_err(SkaldError::from)
            .and_then(|s| serde_json::from_str(&s).map_err(SkaldError::from))
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to load cache metadata: {}", e);
                HashMap::new()
            }
        }
    }

    /// Atomic rewrite: serialize to a temp file in the same directory, then
    /// rename over the live index.
    fn save_metadata(&self) {
        let path = self.metadata_path();
        let tmp = self.dir.join("metadata.json.tmp");
        let result = serde_json::to_string_pretty(&self.entries)
            .map_err(SkaldError::from)
            .and_then(|content| {
                std::fs::write(&tmp, content)?;
                std::fs::rename(&tmp, &path)?;
                Ok(())
            });
        if let Err(e) = result {
            warn!("Failed to save cache metadata: {}", e);
        }
    }

    fn clear_expired(&mut self, ttl_hours: f64) {
        let cutoff = chrono::Utc::now() - chrono::Duration::seconds((ttl_hours * 3600.0) as i64);
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, meta)| {
                match chrono::DateTime::parse_from_rfc3339(&meta.created) {
                    Ok(created) => created < cutoff,
                    // Unreadable timestamp counts as expired
                    Err(_) => true,
                }
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            let path = self.dir.join(format!("{}.wav", key));
            let _ = std::fs::remove_file(path);
            self.entries.remove(key);
        }
        if !expired.is_empty() {
            self.save_metadata();
            info!("Removed {} expired cache items (TTL {}h)", expired.len(), ttl_hours);
        }
    }

    fn enforce_size_limit(&mut self) {
        let max_bytes = self.max_size_mb * 1024 * 1024;
        let mut total: u64 = self.entries.values().map(|m| m.size_bytes).sum();
        if total <= max_bytes {
            return;
        }

        // Evict oldest-accessed first; RFC 3339 UTC strings sort chronologically
        let mut items: Vec<(String, u64, String)> = self
            .entries
            .iter()
            .map(|(k, m)| (k.clone(), m.size_bytes, m.last_accessed.clone()))
            .collect();
        items.sort_by(|a, b| a.2.cmp(&b.2));

        let mut removed = 0usize;
        for (key, size, _) in items {
            if total <= max_bytes {
                break;
            }
            let path = self.dir.join(format!("{}.wav", key));
            let _ = std::fs::remove_file(path);
            self.entries.remove(&key);
            total -= size;
            removed += 1;
        }

        if removed > 0 {
            self.save_metadata();
            info!("Evicted {} cache items to stay under {}MB", removed, self.max_size_mb);
        }
    }
}
