//! Rolling window over a live media playlist.
//!
//! Every refresh re-fetches the upstream manifest, gives each segment a local
//! name derived from its media sequence number and writes the rewritten
//! manifest. Segments are fetched lazily on first request and forgotten once
//! they are older than the configured TTL.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::fetch::{DownloadOptions, Fetcher};
use crate::m3u8::Playlist;
use crate::metrics;

pub const LIVE_PREFIX: &str = "live-";
pub const LIVE_INIT_PREFIX: &str = "mis-";

#[derive(Debug, Default)]
struct Obtained {
    segment: bool,
    init: bool,
}

#[derive(Debug)]
pub struct LiveSegment {
    pub real_url: String,
    pub real_init_url: Option<String>,
    pub created: Instant,
    obtained: Mutex<Obtained>,
}

impl LiveSegment {
    pub fn new(real_url: String, real_init_url: Option<String>, created: Instant) -> Self {
        Self {
            real_url,
            real_init_url,
            created,
            obtained: Mutex::new(Obtained::default()),
        }
    }
}

pub struct LiveWindow {
    url: String,
    referer: Option<String>,
    dir: PathBuf,
    manifest_name: String,
    segments: DashMap<u64, Arc<LiveSegment>>,
    last_refresh: Mutex<Option<Instant>>,
    interval: Duration,
    ttl: Duration,
    body_limit: u64,
}

/// Numeric id of a local name such as `live-42`.
pub fn parse_id(name: &str, prefix: &str) -> Option<u64> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

impl LiveWindow {
    pub fn new(
        url: String,
        referer: Option<String>,
        dir: &Path,
        manifest_name: &str,
        config: &ProxyConfig,
    ) -> Self {
        Self {
            url,
            referer,
            dir: dir.to_path_buf(),
            manifest_name: manifest_name.to_string(),
            segments: DashMap::new(),
            last_refresh: Mutex::new(None),
            interval: config.live_refresh_interval(),
            ttl: config.live_segment_ttl(),
            body_limit: config.max_chunk_size,
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(&self.manifest_name)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.segments.contains_key(&id)
    }

    /// Re-fetches the manifest unless the last refresh is younger than the interval,
    /// and returns the path of the rewritten manifest either way.
    pub async fn refresh(&self, fetcher: &Fetcher) -> Result<PathBuf, ProxyError> {
        let path = self.manifest_path();
        let mut last_refresh = self.last_refresh.lock().await;
        if last_refresh.is_some_and(|at| at.elapsed() < self.interval) {
            metrics::record_cache_hit("live_manifest");
            return Ok(path);
        }

        let swept = self.sweep(Instant::now());
        for id in &swept {
            let _ = tokio::fs::remove_file(self.dir.join(format!("{LIVE_PREFIX}{id}"))).await;
            let _ = tokio::fs::remove_file(self.dir.join(format!("{LIVE_INIT_PREFIX}{id}"))).await;
        }

        let text = fetcher.fetch_text(&self.url, self.referer.as_deref()).await?;
        let mut playlist = Playlist::parse_from(self.url.as_str(), &text)?;
        if playlist.is_master {
            return Err(ProxyError::resolution("live manifest turned into a master playlist"));
        }
        let added = self.register(&mut playlist, Instant::now());

        let mut partial = path.as_os_str().to_owned();
        partial.push(".part");
        tokio::fs::write(&partial, playlist.serialize()).await?;
        tokio::fs::rename(&partial, &path).await?;

        *last_refresh = Some(Instant::now());
        debug!(
            "Live refresh: url={} segments={} added={} swept={} tracked={}",
            self.url,
            playlist.segments.len(),
            added,
            swept.len(),
            self.segments.len()
        );
        Ok(path)
    }

    /// Assigns local names to the segments of `playlist`, tracking ids not seen before.
    pub fn register(&self, playlist: &mut Playlist, now: Instant) -> usize {
        playlist.prefix_relative_uris();
        let sequence = playlist.media_sequence();
        let mut added = 0;

        for (index, segment) in playlist.segments.iter_mut().enumerate() {
            let id = sequence + index as u64;
            let init_url = segment.map_uri().map(|uri| uri.original.clone());

            self.segments.entry(id).or_insert_with(|| {
                added += 1;
                Arc::new(LiveSegment::new(
                    segment.uri.original.clone(),
                    init_url,
                    now,
                ))
            });

            segment.uri.localize(format!("{LIVE_PREFIX}{id}"));
            if let Some(uri) = segment.map_uri_mut() {
                uri.localize(format!("{LIVE_INIT_PREFIX}{id}"));
            }
        }
        added
    }

    /// Drops entries older than the TTL and returns their ids.
    pub fn sweep(&self, now: Instant) -> Vec<u64> {
        let mut removed = Vec::new();
        self.segments.retain(|id, segment| {
            let keep = now.saturating_duration_since(segment.created) < self.ttl;
            if !keep {
                removed.push(*id);
            }
            keep
        });
        removed
    }

    fn segment(&self, name: &str, prefix: &str) -> Result<(u64, Arc<LiveSegment>), ProxyError> {
        let id = parse_id(name, prefix).ok_or_else(|| ProxyError::not_found(name))?;
        let segment = self
            .segments
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ProxyError::not_found(name))?;
        Ok((id, segment))
    }

    pub async fn serve_segment(&self, name: &str, fetcher: &Fetcher) -> Result<PathBuf, ProxyError> {
        let (id, segment) = self.segment(name, LIVE_PREFIX)?;
        let path = self.dir.join(format!("{LIVE_PREFIX}{id}"));

        let mut obtained = segment.obtained.lock().await;
        if obtained.segment {
            metrics::record_cache_hit("live");
            return Ok(path);
        }
        self.download(fetcher, &segment.real_url, &path, false).await?;
        obtained.segment = true;
        Ok(path)
    }

    pub async fn serve_init(&self, name: &str, fetcher: &Fetcher) -> Result<PathBuf, ProxyError> {
        let (id, segment) = self.segment(name, LIVE_INIT_PREFIX)?;
        let init_url = segment
            .real_init_url
            .as_deref()
            .ok_or_else(|| ProxyError::not_found(name))?;
        let path = self.dir.join(format!("{LIVE_INIT_PREFIX}{id}"));

        let mut obtained = segment.obtained.lock().await;
        if obtained.init {
            metrics::record_cache_hit("live");
            return Ok(path);
        }
        self.download(fetcher, init_url, &path, true).await?;
        obtained.init = true;
        Ok(path)
    }

    /// `hasty` bounds the request with the short timeout; only init sections use it.
    async fn download(&self, fetcher: &Fetcher, url: &str, path: &Path, hasty: bool) -> Result<(), ProxyError> {
        metrics::record_fetch("live");
        let options = DownloadOptions {
            referer: self.referer.as_deref(),
            hasty,
            body_limit: Some(self.body_limit),
        };
        if let Err(e) = fetcher.download_file(url, path, options).await {
            warn!("Live segment fetch failed: url={} err={}", url, e);
            return Err(e);
        }
        Ok(())
    }
}
