//! In-memory metadata map with durable per-resource records
//!
//! Every resource owns a small record at `<dir>/Metadata/<key>.<ext>`,
//! rewritten atomically (unique temp file, fsync, rename) on each change.
//! On startup [`MetadataStore::load_all`] decodes the records and reconciles
//! them against the data files actually present.

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::ranges::{ByteRange, RangeSet};
use crate::storage::metadata::{MetadataRecord, ResourceMetadata};
use crate::types::ResourceKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Map of resource key to metadata, with durable persistence
pub struct MetadataStore {
    config: Arc<CacheConfig>,
    entries: RwLock<HashMap<ResourceKey, ResourceMetadata>>,
}

impl MetadataStore {
    /// Create an empty store; call [`load_all`](Self::load_all) to populate
    pub fn new(config: Arc<CacheConfig>) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of one resource's metadata
    pub fn get(&self, key: &ResourceKey) -> Option<ResourceMetadata> {
        self.entries.read().get(key).cloned()
    }

    /// Whether a resource is known
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Number of known resources
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of every entry, for eviction candidate collection
    pub fn all(&self) -> Vec<ResourceMetadata> {
        self.entries.read().values().cloned().collect()
    }

    /// Replace an entry in memory and write its durable record
    pub async fn put(&self, metadata: ResourceMetadata) -> Result<()> {
        let key = metadata.key.clone();
        let record = MetadataRecord::from(&metadata);
        self.entries.write().insert(key.clone(), metadata);
        self.persist_record(&key, &record).await
    }

    /// Remove an entry and delete its durable record
    pub async fn remove(&self, key: &ResourceKey) -> Result<Option<ResourceMetadata>> {
        let removed = self.entries.write().remove(key);
        if removed.is_some() {
            let path = self.config.metadata_path(key);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    /// Drop every entry and delete every record file
    pub async fn clear(&self) -> Result<()> {
        let keys: Vec<ResourceKey> = self.entries.read().keys().cloned().collect();
        for key in keys {
            self.remove(&key).await?;
        }
        Ok(())
    }

    /// Write a record atomically: unique temp file in the same directory,
    /// fsync, rename
    async fn persist_record(&self, key: &ResourceKey, record: &MetadataRecord) -> Result<()> {
        let path = self.config.metadata_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = serde_json::to_vec(record)?;
        let temp_name = format!(
            ".{}.{}.{}.tmp",
            key,
            std::process::id(),
            rand::random::<u32>()
        );
        let temp_path = path
            .parent()
            .map(|p| p.join(&temp_name))
            .unwrap_or_else(|| std::path::PathBuf::from(&temp_name));

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&contents).await?;
        file.sync_all().await?;
        drop(file);

        let rename_result = tokio::fs::rename(&temp_path, &path).await;
        if rename_result.is_err() {
            let _ = tokio::fs::remove_file(&temp_path).await;
        }
        rename_result?;
        Ok(())
    }

    /// Enumerate the metadata directory, decode each record, and reconcile
    /// it with the data files on disk
    ///
    /// Reconciliation rules:
    /// - record present, data file missing: completion claim, ranges, and
    ///   byte count are reset (the bytes are gone);
    /// - record present without a total length, data file present: the file
    ///   size is adopted as the total length, and the entry is complete iff
    ///   its ranges cover that length exactly;
    /// - data file present with no record: metadata is synthesized with the
    ///   file size as total length, a single full range, and completion set.
    ///
    /// Returns the sum of cached bytes across all loaded entries.
    pub async fn load_all(&self) -> Result<i64> {
        tokio::fs::create_dir_all(&self.config.cache_directory).await?;
        let metadata_dir = self.config.metadata_directory();
        tokio::fs::create_dir_all(&metadata_dir).await?;

        let mut loaded: HashMap<ResourceKey, ResourceMetadata> = HashMap::new();

        let mut entries = tokio::fs::read_dir(&metadata_dir).await?;
        let record_ext = self.config.metadata_file_extension.as_str();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(record_ext) {
                continue;
            }

            let metadata = match self.decode_record(&path).await {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable metadata record");
                    continue;
                }
            };
            loaded.insert(metadata.key.clone(), metadata);
        }

        // Reconcile records against data files.
        for metadata in loaded.values_mut() {
            let data_path = self.config.data_path(&metadata.key);
            match tokio::fs::metadata(&data_path).await {
                Ok(file_meta) => {
                    let file_size = file_meta.len() as i64;
                    if metadata.total_length.is_none() {
                        metadata.total_length = Some(file_size);
                        metadata.is_complete =
                            metadata.ranges.covers_exactly(file_size);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if metadata.is_complete || !metadata.ranges.is_empty() {
                        debug!(key = %metadata.key, "data file missing, resetting cached state");
                    }
                    metadata.is_complete = false;
                    metadata.ranges = RangeSet::new();
                    metadata.cached_bytes = 0;
                }
                Err(e) => return Err(e.into()),
            }
            metadata.reconcile_derived();
        }

        // Adopt orphan data files that have no record.
        let data_ext = self.config.cache_file_extension.as_str();
        let mut data_entries = tokio::fs::read_dir(&self.config.cache_directory).await?;
        while let Some(entry) = data_entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(data_ext) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(key) = ResourceKey::from_string(stem) else {
                continue;
            };
            if loaded.contains_key(&key) {
                continue;
            }

            let file_size = entry.metadata().await?.len() as i64;
            let mut metadata = ResourceMetadata::new(key.clone(), String::new());
            if file_size > 0 {
                metadata.total_length = Some(file_size);
                metadata
                    .ranges
                    .add(ByteRange::new(0, file_size - 1).expect("non-empty file range"));
                metadata.cached_bytes = file_size;
                metadata.is_complete = true;
            }
            info!(key = %key, file_size, "adopted orphan cache file");
            self.persist_record(&key, &MetadataRecord::from(&metadata))
                .await?;
            loaded.insert(key, metadata);
        }

        let total: i64 = loaded.values().map(|m| m.cached_bytes).sum();
        info!(
            entries = loaded.len(),
            cached_bytes = total,
            "metadata store loaded"
        );
        *self.entries.write() = loaded;
        Ok(total)
    }

    async fn decode_record(&self, path: &std::path::Path) -> Result<ResourceMetadata> {
        let contents = tokio::fs::read(path).await?;
        let record: MetadataRecord = serde_json::from_slice(&contents)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        record.into_metadata()
    }
}
