//! The on-disk decrypted object store.
//!
//! Second cache tier: a size-bounded, content-addressed store of
//! decrypted chunks (and raw stream descriptors, which are not
//! encrypted to begin with) on local disk. Lookups fall through to the
//! upstream origin on miss, decrypting on the way in when the request
//! carries key material.
//!
//! Files live at `<root>/<hash[0..2]>/<hash>` so no directory ever has
//! to enumerate the full cache. A SQLite catalog tracks sizes and
//! access times for the reaper; the filesystem remains the source of
//! truth for reads.
//!
//! The cache is ephemeral and best-effort: every disk failure demotes
//! to a miss (reads) or to fetch-without-cache (writes), and the
//! request proceeds through the origin.

use std::error::Error as StdError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use displaydoc::Display;
use sea_orm::DatabaseConnection;
use tokio::fs;
use tokio::io;
use tokio::sync::Mutex;
use tokio::time;
use tracing::instrument;

use crate::database::Catalog;
use crate::origin::{BlobOrigin, OriginError};
use strand::blob::BlobHash;
use strand::descriptor::{decrypt_blob, KEY_SIZE};

/// Number of write-path lock shards.
const LOCK_SHARDS: usize = 64;

/// How many eviction victims the reaper pulls per catalog query.
const REAP_BATCH: u64 = 100;

/// A store error.
///
/// Clonable so single-flight leaders can broadcast failures to their
/// joiners.
#[derive(Debug, Clone, Display)]
pub enum StoreError {
    /// blob not found
    NotFound,

    /// hash in response does not match the requested hash
    HashMismatch,

    /// origin transport error: {0}
    Transport(String),

    /// decryption error: {0}
    Decryption(String),

    /// disk error: {0}
    Disk(String),

    /// catalog error: {0}
    Catalog(String),

    /// descriptor error: {0}
    Descriptor(String),
}

impl StdError for StoreError {}

impl From<OriginError> for StoreError {
    fn from(error: OriginError) -> Self {
        match error {
            OriginError::NotFound => Self::NotFound,
            OriginError::HashMismatch => Self::HashMismatch,
            OriginError::Transport(e) => Self::Transport(e),
            OriginError::NotImplemented => Self::Transport("not implemented".to_string()),
        }
    }
}

/// Key material for decrypting a fetched blob before caching.
///
/// Absent for stream descriptors, which are stored as-is.
#[derive(Debug, Clone)]
pub struct DecryptionData {
    pub key: [u8; KEY_SIZE],
    pub iv: [u8; KEY_SIZE],
}

/// Disk store configuration.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Root directory of the store.
    pub path: PathBuf,

    /// Size quota for catalogued objects.
    pub max_bytes: u64,

    /// Reaping starts above `max_bytes * high_watermark`.
    pub high_watermark: f64,

    /// Reaping stops below `max_bytes * low_watermark`.
    pub low_watermark: f64,

    /// Interval between reaper runs.
    pub interval: Duration,
}

/// The on-disk decrypted object store.
pub struct DecryptedStore {
    options: StoreOptions,
    origin: Arc<dyn BlobOrigin>,
    db: DatabaseConnection,

    /// Sharded locks for the per-hash write path. Reads go straight to
    /// the filesystem.
    write_locks: Vec<Mutex<()>>,
}

impl DecryptedStore {
    /// Opens the store, creating its directory if needed and sweeping
    /// files that have no catalog row (left over from a crash between
    /// row deletion and file deletion).
    pub async fn open(
        options: StoreOptions,
        origin: Arc<dyn BlobOrigin>,
        db: DatabaseConnection,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(&options.path)
            .await
            .map_err(|e| StoreError::Disk(format!("creating {}: {e}", options.path.display())))?;

        let store = Self {
            options,
            origin,
            db,
            write_locks: (0..LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
        };

        store.sweep_orphans().await;

        Ok(store)
    }

    /// Cache-through get.
    ///
    /// On hit the object is served from disk. On miss it is fetched
    /// from the origin, decrypted when `extra` is present, cached
    /// best-effort and returned.
    pub async fn get(
        &self,
        hash: &BlobHash,
        extra: Option<&DecryptionData>,
    ) -> Result<Bytes, StoreError> {
        let path = self.object_path(hash);

        match fs::read(&path).await {
            Ok(data) => {
                // Bump last_access so the reaper sees this object as live.
                if let Err(e) = self.db.touch_object(hash).await {
                    tracing::warn!(%hash, "failed to touch catalog row: {e}");
                }
                return Ok(Bytes::from(data));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(%hash, "disk read failed, demoting to miss: {e}");
            }
        }

        let blob = self.origin.get(hash).await?;

        let object = match extra {
            Some(dd) => {
                let chunk = decrypt_blob(&blob, &dd.key, &dd.iv)
                    .map_err(|e| StoreError::Decryption(e.to_string()))?;
                Bytes::from(chunk)
            }
            None => blob,
        };

        if let Err(e) = self.write_object(hash, &object).await {
            tracing::warn!(%hash, "failed to cache object, serving uncached: {e}");
        }

        Ok(object)
    }

    /// Returns whether the object is on disk.
    pub async fn has(&self, hash: &BlobHash) -> Result<bool, StoreError> {
        match fs::metadata(self.object_path(hash)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Disk(e.to_string())),
        }
    }

    /// Removes an object from disk, the catalog and, best-effort, the
    /// origin. Origins that do not support deletion are fine.
    pub async fn delete(&self, hash: &BlobHash) -> Result<(), StoreError> {
        self.remove_object(hash.as_str()).await?;

        match self.origin.delete(hash).await {
            Ok(()) | Err(OriginError::NotImplemented) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Flushes and closes the catalog.
    pub async fn shutdown(&self) {
        if let Err(e) = self.db.clone().close().await {
            tracing::warn!("error closing catalog: {e}");
        }
    }

    /// Runs the reaper periodically until the process exits.
    pub async fn run_reaper(self: Arc<Self>) {
        let interval = self.options.interval;

        if interval == Duration::ZERO {
            // disabled
            return;
        }

        loop {
            time::sleep(interval).await;

            // We don't stop even if it errors
            if let Err(e) = self.run_reaper_once().await {
                tracing::warn!("reaper run failed: {e}");
            }
        }
    }

    /// Evicts least-recently-accessed objects while the store is over
    /// its high watermark, down to the low watermark.
    #[instrument(skip_all)]
    pub async fn run_reaper_once(&self) -> Result<(), StoreError> {
        let catalog_err = |e: sea_orm::DbErr| StoreError::Catalog(e.to_string());

        let mut total = self.db.total_bytes().await.map_err(catalog_err)?;
        let high = (self.options.max_bytes as f64 * self.options.high_watermark) as u64;
        let low = (self.options.max_bytes as f64 * self.options.low_watermark) as u64;

        if total <= high {
            return Ok(());
        }

        tracing::info!(
            total,
            quota = self.options.max_bytes,
            "disk cache over high watermark, reaping"
        );

        let mut evicted = 0u64;
        'reap: while total > low {
            let victims = self
                .db
                .least_recently_accessed(REAP_BATCH)
                .await
                .map_err(catalog_err)?;

            if victims.is_empty() {
                break;
            }

            for victim in victims {
                // Row first, then file: a crash in between leaves an
                // orphan file that the startup sweep removes.
                self.db
                    .forget_object(&victim.hash)
                    .await
                    .map_err(catalog_err)?;

                let path = self.path_for(&victim.hash);
                match fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!("failed to remove {}: {e}", path.display()),
                }

                total = total.saturating_sub(victim.size_bytes.max(0) as u64);
                evicted += 1;

                if total <= low {
                    break 'reap;
                }
            }
        }

        tracing::info!(evicted, total, "reaper pass complete");

        Ok(())
    }

    fn object_path(&self, hash: &BlobHash) -> PathBuf {
        self.path_for(hash.as_str())
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        self.options.path.join(&hash[..2]).join(hash)
    }

    fn write_lock(&self, hash: &BlobHash) -> &Mutex<()> {
        // First hex byte of the hash picks the shard
        let shard = usize::from_str_radix(&hash.as_str()[..2], 16).unwrap_or(0) % LOCK_SHARDS;
        &self.write_locks[shard]
    }

    async fn write_object(&self, hash: &BlobHash, object: &[u8]) -> Result<(), StoreError> {
        let _guard = self.write_lock(hash).lock().await;

        let path = self.object_path(hash);
        if fs::metadata(&path).await.is_ok() {
            // Lost a race against another writer; the content is
            // identical by construction.
            return Ok(());
        }

        let parent = path.parent().unwrap();
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::Disk(format!("creating {}: {e}", parent.display())))?;

        // Write to a temp file, then rename so readers never observe a
        // partial object.
        let tmp = parent.join(format!(".{}.tmp", hash.as_str()));
        fs::write(&tmp, object)
            .await
            .map_err(|e| StoreError::Disk(format!("writing {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::Disk(format!("renaming into {}: {e}", path.display())))?;

        self.db
            .record_object(hash, object.len() as u64)
            .await
            .map_err(|e| StoreError::Catalog(e.to_string()))?;

        Ok(())
    }

    async fn remove_object(&self, hash: &str) -> Result<(), StoreError> {
        self.db
            .forget_object(hash)
            .await
            .map_err(|e| StoreError::Catalog(e.to_string()))?;

        match fs::remove_file(self.path_for(hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Disk(e.to_string())),
        }
    }

    /// Deletes files that have no catalog row.
    async fn sweep_orphans(&self) {
        let known = match self.db.all_hashes().await {
            Ok(hashes) => hashes.into_iter().collect::<std::collections::HashSet<_>>(),
            Err(e) => {
                tracing::warn!("orphan sweep skipped, catalog unavailable: {e}");
                return;
            }
        };

        let mut removed = 0u64;
        if let Err(e) = self.walk_shards(&known, &mut removed).await {
            tracing::warn!("orphan sweep aborted: {e}");
        }

        if removed > 0 {
            tracing::info!(removed, "removed orphan cache files");
        }
    }

    async fn walk_shards(
        &self,
        known: &std::collections::HashSet<String>,
        removed: &mut u64,
    ) -> std::io::Result<()> {
        let mut shards = fs::read_dir(&self.options.path).await?;

        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }

            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name();
                let name = name.to_string_lossy();

                if !known.contains(name.as_ref()) {
                    match fs::remove_file(file.path()).await {
                        Ok(()) => *removed += 1,
                        Err(e) => {
                            tracing::warn!("failed to remove orphan {}: {e}", name);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
