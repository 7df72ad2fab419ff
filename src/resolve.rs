//! Turns a user supplied playlist URL into something the proxy can serve.
//!
//! Master playlists are walked down to a single media playlist (or a matched
//! video and audio pair), relative URIs are made absolute, the first entry is
//! probed for reachability and the key and init section of the first segment
//! are pulled to fixed local names.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};
use url::Url;

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::fetch::{DownloadOptions, Fetcher};
use crate::m3u8::{self, Playlist, Track, EXTM3U};

pub const DECRYPT_KEY: &str = "decrypt.key";
pub const DECRYPT_AUDIO_KEY: &str = "decrypt-audio.key";
pub const MEDIA_INIT_SECTION: &str = "mis.key";
pub const MEDIA_INIT_SECTION_AUDIO: &str = "mis-audio.key";

const GOOGLEVIDEO_MANIFEST_HOST: &str = "manifest.googlevideo.com";
const ORIGINAL_AUDIO_MARKER: &str = "acont=original";

/// Decides which URLs point at media hosted by this server itself.
#[derive(Debug, Clone)]
pub struct TrustedSources {
    domain: Option<String>,
    media_dir: PathBuf,
}

impl TrustedSources {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            domain: config
                .trusted_domain
                .as_ref()
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty()),
            media_dir: config.media_dir.clone(),
        }
    }

    pub fn is_trusted(&self, url: &str) -> bool {
        let Some(domain) = &self.domain else {
            return false;
        };
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .is_some_and(|host| &host == domain)
    }

    /// File under the media directory that a trusted `/media/...` URL refers to.
    pub fn local_path(&self, url: &str) -> Option<PathBuf> {
        if !self.is_trusted(url) {
            return None;
        }
        let parsed = Url::parse(url).ok()?;
        let relative = parsed.path().strip_prefix("/media/")?;
        let relative = Path::new(relative);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.media_dir.join(relative))
    }
}

/// Outcome of resolving an entry URL.
#[derive(Debug, Clone)]
pub enum ResolvedMedia {
    Vod(Playlist),
    Live(Playlist),
    /// Separate video and audio media playlists plus a master reduced to the chosen pair.
    DualTrack {
        master: Playlist,
        video: Playlist,
        audio: Playlist,
    },
}

#[derive(Debug, Clone)]
pub struct Resolved {
    /// Text of the top level playlist as received.
    pub source: String,
    pub media: ResolvedMedia,
}

pub struct Resolver<'a> {
    config: &'a ProxyConfig,
    fetcher: &'a Fetcher,
    trusted: &'a TrustedSources,
}

impl<'a> Resolver<'a> {
    pub fn new(config: &'a ProxyConfig, fetcher: &'a Fetcher, trusted: &'a TrustedSources) -> Self {
        Self {
            config,
            fetcher,
            trusted,
        }
    }

    /// Resolves `url`; VOD keys and init sections land in `dir`.
    pub async fn resolve(
        &self,
        url: &str,
        referer: Option<&str>,
        dir: &Path,
    ) -> Result<Resolved, ProxyError> {
        let (source, top) = self.load(url, referer).await?;

        let media = if top.is_master && !top.audio_renditions.is_empty() {
            self.resolve_dual_track(top, referer, dir).await?
        } else {
            let mut playlist = self.descend(top, referer).await?;
            self.finish_media(&mut playlist, referer).await?;
            if playlist.is_live {
                ResolvedMedia::Live(playlist)
            } else {
                self.localize_key_and_map(&mut playlist, referer, dir, DECRYPT_KEY, MEDIA_INIT_SECTION)
                    .await?;
                ResolvedMedia::Vod(playlist)
            }
        };

        Ok(Resolved { source, media })
    }

    async fn load(&self, url: &str, referer: Option<&str>) -> Result<(String, Playlist), ProxyError> {
        let text = match self.trusted.local_path(url) {
            Some(path) => {
                debug!("Reading trusted playlist: url={} path={}", url, path.display());
                tokio::fs::read_to_string(&path).await?
            }
            None => self.fetcher.fetch_text(url, referer).await?,
        };
        let playlist = Playlist::parse_from(url, &text)?;
        Ok((text, playlist))
    }

    /// Follows best tracks until a media playlist is reached. The top level master is
    /// depth 0, so up to `max_playlist_depth` masters may be nested below it.
    async fn descend(&self, mut playlist: Playlist, referer: Option<&str>) -> Result<Playlist, ProxyError> {
        let mut depth = 0;
        while playlist.is_master {
            if depth > self.config.max_playlist_depth {
                return Err(ProxyError::resolution(format!(
                    "playlist nesting exceeds the maximum depth of {}",
                    self.config.max_playlist_depth
                )));
            }

            playlist.prefix_relative_uris();
            self.validate(&playlist, referer).await?;

            let index = self
                .select_track(&playlist)
                .ok_or_else(|| ProxyError::resolution("master playlist has no tracks"))?;
            let track_url = playlist.tracks[index].uri.original.clone();
            info!(
                "Selected track: depth={} height={} url={}",
                depth,
                playlist.tracks[index].height(),
                track_url
            );
            playlist = self.load(&track_url, referer).await?.1;
            depth += 1;
        }
        Ok(playlist)
    }

    fn select_track(&self, playlist: &Playlist) -> Option<usize> {
        let is_googlevideo = Url::parse(&playlist.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h == GOOGLEVIDEO_MANIFEST_HOST))
            .unwrap_or(false);

        if is_googlevideo {
            let original_audio = |track: &Track| {
                Url::parse(&track.uri.original)
                    .map(|u| u.path().contains(ORIGINAL_AUDIO_MARKER))
                    .unwrap_or(false)
            };
            return playlist.best_track(Some(&original_audio));
        }
        playlist.best_track(None)
    }

    async fn resolve_dual_track(
        &self,
        mut master: Playlist,
        referer: Option<&str>,
        dir: &Path,
    ) -> Result<ResolvedMedia, ProxyError> {
        master.prefix_relative_uris();
        self.validate(&master, referer).await?;

        let track_index = master
            .track_by_video_height(self.config.target_video_height)
            .ok_or_else(|| ProxyError::resolution("master playlist has no tracks"))?;
        let track = master.tracks[track_index].clone();
        let group = track
            .audio_group()
            .ok_or_else(|| ProxyError::resolution("selected track declares no AUDIO group"))?
            .to_string();
        let rendition_index = master.audio_rendition_for_group(&group).ok_or_else(|| {
            ProxyError::resolution(format!("no audio rendition matches group {group}"))
        })?;
        let rendition = master.audio_renditions[rendition_index].clone();
        let audio_url = rendition
            .uri()
            .map(|uri| uri.original.clone())
            .ok_or_else(|| ProxyError::resolution("selected audio rendition has no URI"))?;

        info!(
            "Dual-track selection: height={} group={} audio_name=\"{}\"",
            track.height(),
            group,
            rendition.name()
        );

        let (_, mut video) = self.load(&track.uri.original, referer).await?;
        let (_, mut audio) = self.load(&audio_url, referer).await?;
        if video.is_master || audio.is_master {
            return Err(ProxyError::resolution(
                "dual-track renditions must be media playlists",
            ));
        }

        self.finish_media(&mut video, referer).await?;
        self.finish_media(&mut audio, referer).await?;
        if video.is_live || audio.is_live {
            return Err(ProxyError::resolution("live dual-track streams are not supported"));
        }

        self.localize_key_and_map(&mut video, referer, dir, DECRYPT_KEY, MEDIA_INIT_SECTION)
            .await?;
        self.localize_key_and_map(
            &mut audio,
            referer,
            dir,
            DECRYPT_AUDIO_KEY,
            MEDIA_INIT_SECTION_AUDIO,
        )
        .await?;

        master.tracks = vec![track];
        master.audio_renditions = vec![rendition];
        Ok(ResolvedMedia::DualTrack {
            master,
            video,
            audio,
        })
    }

    async fn finish_media(&self, playlist: &mut Playlist, referer: Option<&str>) -> Result<(), ProxyError> {
        playlist.prefix_relative_uris();

        if playlist.segments.is_empty() {
            return Err(ProxyError::resolution(format!(
                "playlist {} has no segments",
                playlist.url
            )));
        }
        if playlist.remove_trailing_segment(self.config.min_segment_length) {
            debug!("Dropped short trailing segment: url={}", playlist.url);
        }

        let duration = playlist.total_duration();
        if duration > self.config.max_playlist_duration_secs {
            return Err(ProxyError::resolution(format!(
                "playlist duration {:.0}s exceeds the limit of {:.0}s",
                duration, self.config.max_playlist_duration_secs
            )));
        }

        self.validate(playlist, referer).await
    }

    /// Probes the first track or segment; masters must answer with playlist text.
    async fn validate(&self, playlist: &Playlist, referer: Option<&str>) -> Result<(), ProxyError> {
        let first = if playlist.is_master {
            playlist.tracks.first().map(|t| t.uri.original.as_str())
        } else {
            playlist.segments.first().map(|s| s.uri.original.as_str())
        };
        let Some(first) = first else {
            return Err(ProxyError::resolution("playlist is empty"));
        };
        if !m3u8::is_absolute(first) {
            return Err(ProxyError::resolution(format!(
                "cannot resolve relative URI {first}"
            )));
        }

        let head = match self.trusted.local_path(first) {
            Some(path) => tokio::fs::read(&path)
                .await
                .map(|mut bytes| {
                    bytes.truncate(crate::sniff::SNIFF_LEN);
                    bytes::Bytes::from(bytes)
                })
                .map_err(|e| ProxyError::resolution(format!("{first} is unreadable: {e}")))?,
            None => self.fetcher.probe(first, referer).await.map_err(|e| {
                ProxyError::resolution(format!("validation request failed: {e}"))
            })?,
        };

        if playlist.is_master {
            let text = String::from_utf8_lossy(&head);
            if !text.trim_start_matches('\u{feff}').trim_start().starts_with(EXTM3U) {
                return Err(ProxyError::resolution(format!(
                    "{first} did not answer with a playlist"
                )));
            }
        }
        Ok(())
    }

    /// Pulls the key and init section of segment 0 into `dir` under fixed names and
    /// points every segment sharing them at the local copies.
    async fn localize_key_and_map(
        &self,
        playlist: &mut Playlist,
        referer: Option<&str>,
        dir: &Path,
        key_name: &str,
        map_name: &str,
    ) -> Result<(), ProxyError> {
        let Some(first) = playlist.segments.first() else {
            return Ok(());
        };
        let key_url = first.key_uri().map(|uri| uri.original.clone());
        let map_url = first.map_uri().map(|uri| uri.original.clone());

        let options = DownloadOptions {
            referer,
            hasty: true,
            body_limit: Some(self.config.max_chunk_size),
        };

        if let Some(key_url) = key_url {
            self.fetcher
                .download_file(&key_url, &dir.join(key_name), options)
                .await
                .map_err(|e| {
                    warn!("Failed to fetch decryption key: url={} err={}", key_url, e);
                    e
                })?;
            for segment in &mut playlist.segments {
                if let Some(uri) = segment.key_uri_mut().filter(|u| u.original == key_url) {
                    uri.localize(key_name);
                }
            }
        }

        if let Some(map_url) = map_url {
            match self
                .fetcher
                .download_file(&map_url, &dir.join(map_name), options)
                .await
            {
                Ok(_) => {
                    for segment in &mut playlist.segments {
                        if let Some(uri) = segment.map_uri_mut().filter(|u| u.original == map_url) {
                            uri.localize(map_name);
                        }
                    }
                }
                Err(e) => warn!("Failed to fetch init section, continuing: url={} err={}", map_url, e),
            }
        }
        Ok(())
    }
}
