use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::error::ProxyError;
use crate::fetch::{DownloadOptions, Fetcher};
use crate::m3u8::Playlist;
use crate::metrics;

pub const VIDEO_PREFIX: &str = "vi-";
pub const AUDIO_PREFIX: &str = "au-";
pub const MAX_CHUNK_NAME_LENGTH: usize = 26;

/// Lets an error through at most once per interval.
struct LogThrottle {
    last: parking_lot::Mutex<Option<Instant>>,
    every: Duration,
}

impl LogThrottle {
    fn new(every: Duration) -> Self {
        Self {
            last: parking_lot::Mutex::new(None),
            every,
        }
    }

    fn ready(&self) -> bool {
        let mut last = self.last.lock();
        let now = Instant::now();
        if last.is_some_and(|at| now.duration_since(at) < self.every) {
            return false;
        }
        *last = Some(now);
        true
    }
}

struct ChunkSlot {
    url: String,
    /// Held for the whole download so concurrent requests queue behind one fetch.
    fetched: Mutex<bool>,
}

/// On-demand cache of the segments of one VOD media playlist.
pub struct HlsProxy {
    referer: Option<String>,
    dir: PathBuf,
    prefix: &'static str,
    body_limit: u64,
    chunks: Vec<ChunkSlot>,
    error_log: LogThrottle,
}

impl HlsProxy {
    /// Renames every segment to `{prefix}{index}`, remembers the upstream URLs and
    /// writes the rewritten playlist to `dir/manifest_name`.
    pub async fn prepare(
        playlist: &mut Playlist,
        dir: &Path,
        manifest_name: &str,
        prefix: &'static str,
        referer: Option<String>,
        body_limit: u64,
    ) -> Result<Self, ProxyError> {
        let mut chunks = Vec::with_capacity(playlist.segments.len());
        for (id, segment) in playlist.segments.iter_mut().enumerate() {
            chunks.push(ChunkSlot {
                url: segment.uri.original.clone(),
                fetched: Mutex::new(false),
            });
            segment.uri.localize(format!("{prefix}{id}"));
        }

        tokio::fs::write(dir.join(manifest_name), playlist.serialize()).await?;
        debug!(
            "Prepared HLS proxy: manifest={} chunks={} prefix={}",
            manifest_name,
            chunks.len(),
            prefix
        );

        Ok(Self {
            referer,
            dir: dir.to_path_buf(),
            prefix,
            body_limit,
            chunks,
            error_log: LogThrottle::new(Duration::from_secs(1)),
        })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunk index encoded in a local chunk name such as `vi-12`.
    pub fn chunk_id(&self, name: &str) -> Option<usize> {
        if name.len() > MAX_CHUNK_NAME_LENGTH {
            return None;
        }
        let digits = name.strip_prefix(self.prefix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    pub fn original_url(&self, id: usize) -> Option<&str> {
        self.chunks.get(id).map(|chunk| chunk.url.as_str())
    }

    /// Path of the cached chunk, downloading it first if no request has done so yet.
    pub async fn serve_chunk(&self, id: usize, fetcher: &Fetcher) -> Result<PathBuf, ProxyError> {
        let chunk = self
            .chunks
            .get(id)
            .ok_or_else(|| ProxyError::not_found(format!("{}{}", self.prefix, id)))?;
        let path = self.dir.join(format!("{}{}", self.prefix, id));

        let mut fetched = chunk.fetched.lock().await;
        if *fetched {
            metrics::record_cache_hit("chunk");
            return Ok(path);
        }

        metrics::record_fetch("chunk");
        let options = DownloadOptions {
            referer: self.referer.as_deref(),
            hasty: false,
            body_limit: Some(self.body_limit),
        };
        if let Err(e) = fetcher.download_file(&chunk.url, &path, options).await {
            if self.error_log.ready() {
                error!("Chunk fetch failed: id={}{} url={} err={}", self.prefix, id, chunk.url, e);
            }
            return Err(e);
        }

        *fetched = true;
        Ok(path)
    }
}
