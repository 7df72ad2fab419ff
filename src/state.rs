//! The proxy session: which proxy is active and how requests reach it.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, RwLock};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::fetch::Fetcher;
use crate::file_proxy::FileProxy;
use crate::hls::{HlsProxy, AUDIO_PREFIX, VIDEO_PREFIX};
use crate::live::{LiveWindow, LIVE_INIT_PREFIX, LIVE_PREFIX};
use crate::m3u8::{self, Playlist};
use crate::metrics;
use crate::range::parse_range_header;
use crate::resolve::{
    ResolvedMedia, Resolver, TrustedSources, DECRYPT_AUDIO_KEY, DECRYPT_KEY, MEDIA_INIT_SECTION,
    MEDIA_INIT_SECTION_AUDIO,
};
use crate::sniff::{self, M3U8_CONTENT_TYPE, SNIFF_LEN};

pub const ORIGINAL_M3U8: &str = "original.m3u8";
pub const PROXY_M3U8: &str = "proxy.m3u8";
pub const VIDEO_M3U8: &str = "video.m3u8";
pub const AUDIO_M3U8: &str = "audio.m3u8";

const HLS_SUFFIXES: [&str; 3] = [".m3u8", ".m3u", ".txt"];

/// A playback entry handed over by the surrounding server.
#[derive(Debug, Clone, Deserialize)]
pub struct Entry {
    pub url: String,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub use_proxy: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EntrySource {
    pub url: String,
    pub proxied: bool,
}

#[derive(Clone, Default)]
pub enum ActiveProxy {
    #[default]
    None,
    Vod {
        dir: PathBuf,
        video: Arc<HlsProxy>,
        audio: Option<Arc<HlsProxy>>,
    },
    Live {
        dir: PathBuf,
        window: Arc<LiveWindow>,
    },
    Generic {
        dir: PathBuf,
        proxy: Arc<FileProxy>,
    },
}

impl ActiveProxy {
    fn dir(&self) -> Option<&Path> {
        match self {
            Self::None => None,
            Self::Vod { dir, .. } | Self::Live { dir, .. } | Self::Generic { dir, .. } => Some(dir),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Vod { audio: None, .. } => "vod",
            Self::Vod { .. } => "dual-track",
            Self::Live { .. } => "live",
            Self::Generic { .. } => "generic",
        }
    }
}

/// True when `url` names a playlist by its path, or carries one in a query parameter.
pub fn is_hls_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    if has_hls_suffix(parsed.path()) {
        return true;
    }
    parsed.query_pairs().any(|(_, value)| {
        m3u8::is_absolute(&value)
            && Url::parse(&value)
                .map(|nested| has_hls_suffix(nested.path()))
                .unwrap_or(false)
    })
}

fn has_hls_suffix(path: &str) -> bool {
    let path = path.to_ascii_lowercase();
    HLS_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
}

pub struct ProxyState {
    config: ProxyConfig,
    fetcher: Fetcher,
    trusted: TrustedSources,
    setup_lock: Mutex<()>,
    active: RwLock<ActiveProxy>,
    generation: AtomicU64,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Result<Self, reqwest::Error> {
        let fetcher = Fetcher::new(&config)?;
        let trusted = TrustedSources::new(&config);
        Ok(Self {
            config,
            fetcher,
            trusted,
            setup_lock: Mutex::new(()),
            active: RwLock::new(ActiveProxy::None),
            generation: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub async fn active(&self) -> ActiveProxy {
        self.active.read().await.clone()
    }

    /// Sets up HLS proxying for `url`; on failure the previous proxy keeps serving.
    pub async fn setup_hls_proxy(&self, url: &str, referer: Option<&str>) -> bool {
        match self.try_setup_hls_proxy(url, referer).await {
            Ok(()) => true,
            Err(e) => {
                warn!("HLS proxy setup failed: url={} err={}", url, e);
                false
            }
        }
    }

    pub async fn setup_generic_proxy(&self, url: &str, referer: Option<&str>) -> bool {
        match self.try_setup_generic_proxy(url, referer).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Generic proxy setup failed: url={} err={}", url, e);
                false
            }
        }
    }

    pub async fn try_setup_hls_proxy(&self, url: &str, referer: Option<&str>) -> Result<(), ProxyError> {
        let _guard = self.setup_lock.lock().await;
        let dir = self.create_generation_dir().await?;
        match self.build_hls(url, referer, &dir).await {
            Ok(active) => {
                info!("HLS proxy installed: url={} kind={}", url, active.kind());
                self.install(active).await;
                Ok(())
            }
            Err(e) => {
                remove_dir(&dir).await;
                Err(e)
            }
        }
    }

    /// Returns the local file name the proxied file is served under.
    pub async fn try_setup_generic_proxy(
        &self,
        url: &str,
        referer: Option<&str>,
    ) -> Result<String, ProxyError> {
        let _guard = self.setup_lock.lock().await;
        let dir = self.create_generation_dir().await?;
        match FileProxy::open(url, referer, &dir, self.fetcher.clone(), &self.config).await {
            Ok(proxy) => {
                let filename = proxy.filename().to_string();
                self.install(ActiveProxy::Generic { dir, proxy }).await;
                Ok(filename)
            }
            Err(e) => {
                remove_dir(&dir).await;
                Err(e)
            }
        }
    }

    /// Decides whether and how an entry is proxied and returns the URL clients should play.
    pub async fn setup_entry(&self, entry: &Entry) -> Result<EntrySource, ProxyError> {
        let unproxied = EntrySource {
            url: entry.url.clone(),
            proxied: false,
        };
        if !entry.use_proxy {
            return Ok(unproxied);
        }
        if !m3u8::is_absolute(&entry.url) {
            return Err(ProxyError::bad_request(format!(
                "entry URL {} is not absolute",
                entry.url
            )));
        }

        let referer = entry.referer.as_deref().filter(|r| !r.is_empty());
        let route = self.config.route.trim_end_matches('/');
        let local = if is_hls_url(&entry.url) {
            self.try_setup_hls_proxy(&entry.url, referer).await?;
            format!("{route}/{PROXY_M3U8}")
        } else {
            let filename = self.try_setup_generic_proxy(&entry.url, referer).await?;
            format!("{route}/{filename}")
        };
        Ok(EntrySource {
            url: local,
            proxied: true,
        })
    }

    async fn build_hls(&self, url: &str, referer: Option<&str>, dir: &Path) -> Result<ActiveProxy, ProxyError> {
        let resolver = Resolver::new(&self.config, &self.fetcher, &self.trusted);
        let resolved = resolver.resolve(url, referer, dir).await?;
        tokio::fs::write(dir.join(ORIGINAL_M3U8), &resolved.source).await?;

        let referer = referer.map(str::to_string);
        let limit = self.config.max_chunk_size;
        let dir_buf = dir.to_path_buf();

        match resolved.media {
            ResolvedMedia::Vod(mut playlist) => {
                let video =
                    HlsProxy::prepare(&mut playlist, dir, PROXY_M3U8, VIDEO_PREFIX, referer, limit).await?;
                Ok(ActiveProxy::Vod {
                    dir: dir_buf,
                    video: Arc::new(video),
                    audio: None,
                })
            }
            ResolvedMedia::Live(playlist) => {
                let window = LiveWindow::new(playlist.url, referer, dir, PROXY_M3U8, &self.config);
                window.refresh(&self.fetcher).await?;
                Ok(ActiveProxy::Live {
                    dir: dir_buf,
                    window: Arc::new(window),
                })
            }
            ResolvedMedia::DualTrack {
                mut master,
                mut video,
                mut audio,
            } => {
                let video_proxy = HlsProxy::prepare(
                    &mut video,
                    dir,
                    VIDEO_M3U8,
                    VIDEO_PREFIX,
                    referer.clone(),
                    limit,
                )
                .await?;
                let audio_proxy =
                    HlsProxy::prepare(&mut audio, dir, AUDIO_M3U8, AUDIO_PREFIX, referer, limit).await?;
                write_dual_master(&mut master, dir).await?;
                Ok(ActiveProxy::Vod {
                    dir: dir_buf,
                    video: Arc::new(video_proxy),
                    audio: Some(Arc::new(audio_proxy)),
                })
            }
        }
    }

    async fn create_generation_dir(&self) -> Result<PathBuf, ProxyError> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let dir = self.config.content_dir.join(format!("gen-{generation}"));
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Swaps in `active`, stops the previous proxy and purges every other generation.
    async fn install(&self, active: ActiveProxy) {
        let keep = active.dir().map(Path::to_path_buf);
        let previous = std::mem::replace(&mut *self.active.write().await, active);
        if let ActiveProxy::Generic { proxy, .. } = &previous {
            proxy.close();
        }
        drop(previous);

        let mut entries = match tokio::fs::read_dir(&self.config.content_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to list proxy directory: dir={} err={}", self.config.content_dir.display(), e);
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if Some(&path) == keep.as_ref() {
                continue;
            }
            let result = if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            if let Err(e) = result {
                warn!("Failed to purge stale proxy data: path={} err={}", path.display(), e);
            }
        }
    }

    /// Answers a request for `name` under the proxy route.
    pub async fn serve(&self, name: &str, method: &Method, headers: &HeaderMap) -> Response {
        match self.try_serve(name, method, headers).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Proxy request failed: name={} err={}", name, e);
                e.into_response()
            }
        }
    }

    async fn try_serve(&self, name: &str, method: &Method, headers: &HeaderMap) -> Result<Response, ProxyError> {
        match self.active().await {
            ActiveProxy::None => Err(ProxyError::NoProxy),
            ActiveProxy::Vod { dir, video, audio } => {
                if let Some(id) = video.chunk_id(name) {
                    let path = video.serve_chunk(id, &self.fetcher).await?;
                    return serve_file(&path, None, method, headers, "chunk").await;
                }
                if let Some((audio, id)) = audio.as_ref().and_then(|a| a.chunk_id(name).map(|id| (a, id))) {
                    let path = audio.serve_chunk(id, &self.fetcher).await?;
                    return serve_file(&path, None, method, headers, "chunk").await;
                }

                let dual = audio.is_some();
                let allowed = match name {
                    PROXY_M3U8 | DECRYPT_KEY | MEDIA_INIT_SECTION => true,
                    VIDEO_M3U8 | AUDIO_M3U8 | DECRYPT_AUDIO_KEY | MEDIA_INIT_SECTION_AUDIO => dual,
                    _ => false,
                };
                if !allowed {
                    return Err(ProxyError::not_found(name));
                }
                let content_type = name.ends_with(".m3u8").then_some(M3U8_CONTENT_TYPE);
                serve_file(&dir.join(name), content_type, method, headers, "manifest").await
            }
            ActiveProxy::Live { window, .. } => {
                if name == PROXY_M3U8 {
                    let path = window.refresh(&self.fetcher).await?;
                    return serve_file(&path, Some(M3U8_CONTENT_TYPE), method, headers, "manifest").await;
                }
                let path = if name.starts_with(LIVE_PREFIX) {
                    window.serve_segment(name, &self.fetcher).await?
                } else if name.starts_with(LIVE_INIT_PREFIX) {
                    window.serve_init(name, &self.fetcher).await?
                } else {
                    return Err(ProxyError::not_found(name));
                };
                serve_file(&path, None, method, headers, "live").await
            }
            ActiveProxy::Generic { proxy, .. } => {
                if name != proxy.filename() {
                    return Err(ProxyError::not_found(name));
                }
                proxy.serve(method, headers)
            }
        }
    }
}

/// Points the reduced master at the local video and audio playlists and writes it.
async fn write_dual_master(master: &mut Playlist, dir: &Path) -> Result<(), ProxyError> {
    for track in &mut master.tracks {
        track.uri.localize(VIDEO_M3U8);
    }
    for rendition in &mut master.audio_renditions {
        if let Some(uri) = rendition.attributes.uri.as_mut() {
            uri.localize(AUDIO_M3U8);
        }
    }
    tokio::fs::write(dir.join(PROXY_M3U8), master.serialize()).await?;
    Ok(())
}

async fn remove_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!("Failed to remove proxy directory: dir={} err={}", dir.display(), e);
    }
}

/// Streams a cached file with single-range support.
async fn serve_file(
    path: &Path,
    content_type: Option<&str>,
    method: &Method,
    headers: &HeaderMap,
    kind: &str,
) -> Result<Response, ProxyError> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ProxyError::not_found(path.file_name().map_or_else(
                || path.display().to_string(),
                |n| n.to_string_lossy().into_owned(),
            )));
        }
        Err(e) => return Err(e.into()),
    };
    let length = file.metadata().await?.len();

    let content_type = match content_type {
        Some(content_type) => content_type.to_string(),
        None => {
            let mut head = vec![0u8; SNIFF_LEN.min(length as usize)];
            file.read_exact(&mut head).await?;
            file.seek(SeekFrom::Start(0)).await?;
            sniff::detect_content_type(&head).to_string()
        }
    };

    let range = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(value) => Some(parse_range_header(value, length)?),
        None => None,
    };

    let builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "no-cache");

    let (builder, body_len) = match range {
        Some(range) => {
            file.seek(SeekFrom::Start(range.start)).await?;
            (
                builder
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(
                        header::CONTENT_RANGE,
                        format!("bytes {}-{}/{}", range.start, range.end, length),
                    )
                    .header(header::CONTENT_LENGTH, range.len().to_string()),
                range.len(),
            )
        }
        None => (
            builder
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, length.to_string()),
            length,
        ),
    };

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        metrics::record_bytes_served(kind, body_len);
        Body::from_stream(ReaderStream::new(file.take(body_len)))
    };
    builder
        .body(body)
        .map_err(|e| ProxyError::bad_request(format!("failed to build response: {e}")))
}
