//! The seekable stream reader.
//!
//! A `Stream` wraps a resolved claim and exposes a byte-addressable
//! read/seek interface over the stream's chunks, fetching them lazily
//! through the hot cache. One `Stream` serves exactly one request; it
//! owns its seek offset and prefetch state and must not be shared
//! across tasks.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{ServerError, ServerResult};
use crate::hot_cache::HotCache;
use crate::resolver::Claim;
use strand::blob::{BlobHash, CHUNK_SIZE, MAX_BLOB_SIZE};
use strand::descriptor::SdBlob;
use strand::media_type::extension_for;
use strand::range::get_range;

/// How many chunks to prefetch ahead of a read.
///
/// 3 is enough to keep a couple of 4 MB/s streams ahead of playback.
pub const DEFAULT_PREFETCH_COUNT: usize = 3;

/// Stream reader options, shared by all streams of a player.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub prefetch: bool,
    pub prefetch_count: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            prefetch: true,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
        }
    }
}

/// A seekable reader over one stream, created per request.
pub struct Stream {
    pub claim: Claim,
    pub content_type: String,

    /// Total plaintext size. Zero until [`Stream::prepare`] when the
    /// claim does not declare one.
    pub size: u64,

    sd_hash: BlobHash,
    sd_blob: Option<Arc<SdBlob>>,

    hot_cache: Arc<HotCache>,
    options: StreamOptions,

    seek_offset: u64,

    /// Chunk indices already scheduled for prefetch in this request.
    scheduled: Arc<Mutex<HashSet<usize>>>,

    /// The most recently read chunk. Sequential reads hit the same
    /// chunk many times; this skips the cache lock.
    last_chunk: Option<(BlobHash, Bytes)>,
}

impl Stream {
    pub fn new(claim: Claim, hot_cache: Arc<HotCache>, options: StreamOptions) -> ServerResult<Self> {
        let sd_hash = claim
            .sd_hash
            .parse::<BlobHash>()
            .map_err(|e| ServerError::RequestError(anyhow!("bad sd hash in claim: {e}")))?;

        Ok(Self {
            content_type: claim.content_type.clone(),
            size: claim.size,
            sd_hash,
            sd_blob: None,
            hot_cache,
            options,
            seek_offset: 0,
            scheduled: Arc::new(Mutex::new(HashSet::new())),
            last_chunk: None,
            claim,
        })
    }

    /// Loads the stream descriptor and recovers the stream size if the
    /// claim does not declare one.
    pub async fn prepare(&mut self) -> ServerResult<()> {
        let sd_blob = self.hot_cache.get_sd_blob(&self.sd_hash).await?;

        if self.size == 0 {
            self.size = self.recover_size(&sd_blob).await?;
        }

        self.sd_blob = Some(sd_blob);

        Ok(())
    }

    /// Stream release time, used for the `Last-Modified` header.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.claim.release_date()
    }

    /// Name of the original file, suitable for saving under on a
    /// filesystem.
    pub fn filename(&self) -> String {
        if let Some(sd) = &self.sd_blob {
            if !sd.suggested_file_name.is_empty() {
                return sd.suggested_file_name.clone();
            }
        }

        if let Some(name) = &self.claim.source_name {
            if !name.is_empty() {
                return name.clone();
            }
        }

        let name = self.claim.name.clone();
        match extension_for(&self.content_type) {
            Some(ext) => name + ext,
            None => name,
        }
    }

    /// Updates the read position.
    pub fn seek(&mut self, pos: SeekFrom) -> ServerResult<u64> {
        if self.size == 0 {
            return Err(ServerError::StreamSizeZero);
        }

        let magnitude = match pos {
            SeekFrom::Start(n) => n,
            SeekFrom::Current(n) | SeekFrom::End(n) => n.unsigned_abs(),
        };
        if magnitude > self.size {
            return Err(ServerError::SeekOutOfBounds);
        }

        let new_offset = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(n) => self.seek_offset as i64 + n,
            SeekFrom::End(n) => self.size as i64 + n,
        };

        if new_offset < 0 {
            return Err(ServerError::SeekBeforeStart);
        }

        self.seek_offset = new_offset as u64;
        Ok(self.seek_offset)
    }

    /// Reads up to `dest.len()` bytes at the current offset, fetching
    /// the covered chunks as needed. Advances the offset by the number
    /// of bytes read.
    pub async fn read(&mut self, dest: &mut [u8]) -> ServerResult<usize> {
        let remaining = self.size.saturating_sub(self.seek_offset);
        let want = (dest.len() as u64).min(remaining) as usize;

        let sr = get_range(self.seek_offset, want);

        let mut read = 0usize;
        for idx in sr.first_chunk_idx..=sr.last_chunk_idx {
            let (offset, len) = sr.byte_range_for_chunk(idx);
            if len == 0 {
                continue;
            }

            let chunk = self.get_chunk(idx as usize).await?;

            let offset = offset as usize;
            let end = (offset + len as usize).min(chunk.len());
            if offset >= chunk.len() {
                break;
            }

            let n = end - offset;
            dest[read..read + n].copy_from_slice(&chunk[offset..end]);
            read += n;
        }

        self.seek_offset += read as u64;

        if read == 0 {
            // An upstream copy loop would spin forever on a
            // zero-length read that reports no error.
            return Err(ServerError::RequestError(anyhow!(
                "read of stream {} at offset {} made no progress",
                self.claim.claim_id,
                self.seek_offset
            )));
        }

        Ok(read)
    }

    /// Returns chunk `idx`, fetching it through the cache tiers.
    pub async fn get_chunk(&mut self, idx: usize) -> ServerResult<Bytes> {
        let sd = self.descriptor()?;

        if idx >= sd.num_chunks() {
            return Err(ServerError::RequestError(anyhow!(
                "chunk index {idx} out of bounds"
            )));
        }

        let info = &sd.blob_infos[idx];
        let hash = info.blob_hash.clone().expect("real chunk has a hash");

        if let Some((last_hash, chunk)) = &self.last_chunk {
            if *last_hash == hash {
                return Ok(chunk.clone());
            }
        }

        let chunk = self.hot_cache.get_chunk(&hash, &sd.key, &info.iv).await?;

        if self.options.prefetch {
            self.spawn_prefetch(idx + 1);
        }

        self.last_chunk = Some((hash, chunk.clone()));

        Ok(chunk)
    }

    /// Warms the cache with the next chunks after `start_idx`.
    /// Fire-and-forget; never surfaces errors to the request.
    fn spawn_prefetch(&self, start_idx: usize) {
        let sd = match &self.sd_blob {
            Some(sd) => sd.clone(),
            None => return,
        };

        let chunks_left = sd.num_chunks().saturating_sub(start_idx);
        let count = self.options.prefetch_count.min(chunks_left);
        if count == 0 {
            return;
        }

        let indices: Vec<usize> = {
            let mut scheduled = self.scheduled.lock();
            (start_idx..start_idx + count)
                .filter(|idx| scheduled.insert(*idx))
                .collect()
        };
        if indices.is_empty() {
            return;
        }

        let hot_cache = self.hot_cache.clone();
        tokio::spawn(async move {
            tracing::debug!(count = indices.len(), "prefetching chunks");

            for idx in indices {
                let info = &sd.blob_infos[idx];
                let hash = info.blob_hash.clone().expect("real chunk has a hash");

                if hot_cache.is_cached(&hash) {
                    tracing::debug!(%hash, "chunk already cached, not prefetching");
                    continue;
                }

                if let Err(e) = hot_cache.get_chunk(&hash, &sd.key, &info.iv).await {
                    tracing::warn!(%hash, "failed to prefetch chunk: {e}");
                    return;
                }
            }
        });
    }

    /// Recovers the stream size for claims that do not declare one.
    async fn recover_size(&self, sd: &Arc<SdBlob>) -> ServerResult<u64> {
        let num_chunks = sd.num_chunks();
        if num_chunks == 0 {
            return Ok(0);
        }

        // Fetch the final chunk; its real length pins down the total.
        let info = &sd.blob_infos[num_chunks - 1];
        let hash = info.blob_hash.clone().expect("real chunk has a hash");

        match self.hot_cache.get_chunk(&hash, &sd.key, &info.iv).await {
            Ok(last_chunk) => {
                Ok(CHUNK_SIZE as u64 * (num_chunks as u64 - 1) + last_chunk.len() as u64)
            }
            Err(e) => {
                tracing::info!(
                    claim_id = %self.claim.claim_id,
                    "couldn't measure final chunk ({e}), estimating size from blob lengths"
                );

                // Legacy estimate: one padding byte per blob, and the
                // cipher padding at the tail is unguessable.
                let mut size: u64 = 0;
                for info in &sd.blob_infos[..num_chunks] {
                    if info.length == MAX_BLOB_SIZE {
                        size += CHUNK_SIZE as u64;
                    } else {
                        size += info.length.saturating_sub(1) as u64;
                    }
                }
                Ok(size.saturating_sub(16))
            }
        }
    }

    fn descriptor(&self) -> ServerResult<&Arc<SdBlob>> {
        self.sd_blob
            .as_ref()
            .ok_or_else(|| ServerError::RequestError(anyhow!("stream is not prepared")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use sea_orm::Database;

    use crate::database::migration::{Migrator, MigratorTrait};
    use crate::store::{DecryptedStore, StoreOptions};
    use crate::testing::{FixtureStream, MemoryOrigin};

    async fn fixture_stream(
        plaintext: Vec<u8>,
        declared_size: u64,
    ) -> (Stream, FixtureStream, Arc<MemoryOrigin>, tempfile::TempDir) {
        let origin = Arc::new(MemoryOrigin::new());
        let fixture = FixtureStream::publish(&origin, plaintext, CHUNK_SIZE);

        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();

        let store = DecryptedStore::open(
            StoreOptions {
                path: dir.path().to_owned(),
                max_bytes: 1024 * 1024 * 1024,
                high_watermark: 0.9,
                low_watermark: 0.8,
                interval: Duration::from_secs(60),
            },
            origin.clone(),
            db,
        )
        .await
        .unwrap();

        let hot_cache = Arc::new(HotCache::new(Arc::new(store), 64 * 1024 * 1024));

        let claim = Claim {
            claim_id: "deadbeef".to_string(),
            name: "fixture".to_string(),
            sd_hash: fixture.sd_hash.as_str().to_owned(),
            content_type: "video/mp4".to_string(),
            size: declared_size,
            release_time: 1_600_000_000,
            ..Default::default()
        };

        let stream = Stream::new(
            claim,
            hot_cache,
            StreamOptions {
                prefetch: false,
                prefetch_count: 0,
            },
        )
        .unwrap();

        (stream, fixture, origin, dir)
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_read_within_one_chunk() {
        let plaintext = patterned(CHUNK_SIZE + 50_000);
        let (mut stream, fixture, _origin, _dir) = fixture_stream(plaintext, 0).await;

        stream.prepare().await.unwrap();
        assert_eq!(stream.size, fixture.plaintext.len() as u64);

        stream.seek(SeekFrom::Start(1000)).unwrap();
        let mut buf = vec![0u8; 105];
        let n = stream.read(&mut buf).await.unwrap();

        assert_eq!(n, 105);
        assert_eq!(&buf[..], &fixture.plaintext[1000..1105]);
    }

    #[tokio::test]
    async fn test_read_across_chunk_boundary() {
        let plaintext = patterned(CHUNK_SIZE + 50_000);
        let (mut stream, fixture, _origin, _dir) = fixture_stream(plaintext, 0).await;

        stream.prepare().await.unwrap();

        // Two bytes from chunk 0, the rest from chunk 1
        let offset = CHUNK_SIZE as i64 - 2;
        stream.seek(SeekFrom::Start(offset as u64)).unwrap();

        let mut buf = vec![0u8; 43];
        let n = stream.read(&mut buf).await.unwrap();

        assert_eq!(n, 43);
        let offset = offset as usize;
        assert_eq!(&buf[..], &fixture.plaintext[offset..offset + 43]);
    }

    #[tokio::test]
    async fn test_repeated_seek_read_is_idempotent() {
        let plaintext = patterned(CHUNK_SIZE + 1234);
        let (mut stream, _fixture, _origin, _dir) = fixture_stream(plaintext, 0).await;

        stream.prepare().await.unwrap();

        let mut first = vec![0u8; 4096];
        stream.seek(SeekFrom::Start(500_000)).unwrap();
        stream.read(&mut first).await.unwrap();

        let mut second = vec![0u8; 4096];
        stream.seek(SeekFrom::Start(500_000)).unwrap();
        stream.read(&mut second).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_sequential_reads_concatenate() {
        let plaintext = patterned(CHUNK_SIZE * 2 + 777);
        let (mut stream, fixture, _origin, _dir) = fixture_stream(plaintext, 0).await;

        stream.prepare().await.unwrap();

        let mut assembled = Vec::new();
        let mut buf = vec![0u8; 700_000];
        stream.seek(SeekFrom::Start(0)).unwrap();
        loop {
            match stream.read(&mut buf).await {
                Ok(n) => assembled.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
            if assembled.len() >= fixture.plaintext.len() {
                break;
            }
        }

        assert_eq!(assembled, fixture.plaintext);
    }

    #[tokio::test]
    async fn test_seek_bounds() {
        let plaintext = patterned(1024);
        let (mut stream, _fixture, _origin, _dir) = fixture_stream(plaintext, 0).await;

        stream.prepare().await.unwrap();
        assert_eq!(stream.size, 1024);

        let err = stream.seek(SeekFrom::Start(4096)).unwrap_err();
        assert_eq!(err.name(), "SeekOutOfBounds");

        let err = stream.seek(SeekFrom::Current(-500)).unwrap_err();
        assert_eq!(err.name(), "SeekBeforeStart");

        // SeekEnd measures backwards from the end
        let pos = stream.seek(SeekFrom::End(-24)).unwrap();
        assert_eq!(pos, 1000);
    }

    #[tokio::test]
    async fn test_seek_zero_size() {
        let plaintext = patterned(1024);
        let (mut stream, _fixture, _origin, _dir) = fixture_stream(plaintext, 0).await;

        // Not prepared: size still zero
        let err = stream.seek(SeekFrom::Start(0)).unwrap_err();
        assert_eq!(err.name(), "StreamSizeZero");
    }

    #[tokio::test]
    async fn test_declared_size_wins() {
        let plaintext = patterned(2048);
        let (mut stream, _fixture, origin, _dir) = fixture_stream(plaintext, 2048).await;

        let before = origin.get_count();
        stream.prepare().await.unwrap();

        assert_eq!(stream.size, 2048);
        // Only the descriptor was fetched, no chunk probe
        assert_eq!(origin.get_count(), before + 1);
    }

    #[tokio::test]
    async fn test_filename_falls_back_to_claim_name() {
        let plaintext = patterned(16);
        let (mut stream, _fixture, _origin, _dir) = fixture_stream(plaintext, 16).await;

        stream.prepare().await.unwrap();
        // The fixture descriptor suggests a name
        assert_eq!(stream.filename(), "fixture.mp4");
    }
}
