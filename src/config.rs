use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub const FIREFOX_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:128.0) Gecko/20100101 Firefox/128.0";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

impl Settings {
    /// Layers the optional TOML file at `path` with `WATCHPROXY__SECTION__KEY` variables.
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("WATCHPROXY")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1337
}

/// Tunables of the proxy engine. Byte sizes are in bytes, the bitrate in bytes per second.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_content_dir")]
    pub content_dir: PathBuf,
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
    /// Host whose `/media/` URLs are read from `media_dir` instead of fetched.
    #[serde(default)]
    pub trusted_domain: Option<String>,
    #[serde(default = "default_route")]
    pub route: String,
    #[serde(default = "default_max_playlist_depth")]
    pub max_playlist_depth: u32,
    #[serde(default = "default_max_playlist_duration_secs")]
    pub max_playlist_duration_secs: f64,
    #[serde(default = "default_min_segment_length")]
    pub min_segment_length: f64,
    #[serde(default = "default_target_video_height")]
    pub target_video_height: u32,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    #[serde(default = "default_file_size_limit")]
    pub file_size_limit: u64,
    #[serde(default = "default_heuristic_bitrate")]
    pub heuristic_bitrate: u64,
    #[serde(default = "default_max_preload")]
    pub max_preload: u64,
    #[serde(default = "default_forward_window_factor")]
    pub forward_window_factor: u64,
    #[serde(default = "default_pre_offset")]
    pub pre_offset: u64,
    #[serde(default = "default_trailing_pull_size")]
    pub trailing_pull_size: u64,
    #[serde(default = "default_generic_chunk_size")]
    pub generic_chunk_size: u64,
    #[serde(default = "default_live_refresh_interval_ms")]
    pub live_refresh_interval_ms: u64,
    #[serde(default = "default_live_segment_ttl_secs")]
    pub live_segment_ttl_secs: u64,
    #[serde(default = "default_hasty_timeout_secs")]
    pub hasty_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            content_dir: default_content_dir(),
            media_dir: default_media_dir(),
            trusted_domain: None,
            route: default_route(),
            max_playlist_depth: default_max_playlist_depth(),
            max_playlist_duration_secs: default_max_playlist_duration_secs(),
            min_segment_length: default_min_segment_length(),
            target_video_height: default_target_video_height(),
            max_chunk_size: default_max_chunk_size(),
            file_size_limit: default_file_size_limit(),
            heuristic_bitrate: default_heuristic_bitrate(),
            max_preload: default_max_preload(),
            forward_window_factor: default_forward_window_factor(),
            pre_offset: default_pre_offset(),
            trailing_pull_size: default_trailing_pull_size(),
            generic_chunk_size: default_generic_chunk_size(),
            live_refresh_interval_ms: default_live_refresh_interval_ms(),
            live_segment_ttl_secs: default_live_segment_ttl_secs(),
            hasty_timeout_secs: default_hasty_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl ProxyConfig {
    pub fn live_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.live_refresh_interval_ms)
    }

    pub fn live_segment_ttl(&self) -> Duration {
        Duration::from_secs(self.live_segment_ttl_secs)
    }

    pub fn hasty_timeout(&self) -> Duration {
        Duration::from_secs(self.hasty_timeout_secs)
    }

    /// How far ahead of a request an in-flight download may be and still be ridden.
    pub fn forward_window(&self) -> u64 {
        self.forward_window_factor * self.heuristic_bitrate
    }
}

fn default_content_dir() -> PathBuf {
    PathBuf::from("content/proxy")
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("content/media")
}

fn default_route() -> String {
    "/watch/proxy".to_string()
}

fn default_max_playlist_depth() -> u32 {
    2
}

fn default_max_playlist_duration_secs() -> f64 {
    86400.0
}

fn default_min_segment_length() -> f64 {
    0.038
}

fn default_target_video_height() -> u32 {
    1080
}

fn default_max_chunk_size() -> u64 {
    50 * MIB
}

fn default_file_size_limit() -> u64 {
    4 * 1024 * MIB
}

fn default_heuristic_bitrate() -> u64 {
    MIB * 7 / 4
}

fn default_max_preload() -> u64 {
    20 * MIB
}

fn default_forward_window_factor() -> u64 {
    2
}

fn default_pre_offset() -> u64 {
    256 * 1024
}

fn default_trailing_pull_size() -> u64 {
    256 * 1024
}

fn default_generic_chunk_size() -> u64 {
    1_000_000
}

fn default_live_refresh_interval_ms() -> u64 {
    1500
}

fn default_live_segment_ttl_secs() -> u64 {
    30
}

fn default_hasty_timeout_secs() -> u64 {
    20
}

fn default_user_agent() -> String {
    FIREFOX_USER_AGENT.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchproxy.toml");
        std::fs::write(
            &path,
            "[server]\nport = 8080\n\n[proxy]\ncontent_dir = \"/tmp/cache\"\nmax_preload = 1024\n",
        )
        .unwrap();

        let settings = Settings::load(path.to_str().unwrap()).unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.proxy.content_dir, PathBuf::from("/tmp/cache"));
        assert_eq!(settings.proxy.max_preload, 1024);
        assert_eq!(settings.proxy.max_playlist_depth, 2);
        assert_eq!(settings.proxy.generic_chunk_size, 1_000_000);
    }

    #[test]
    fn test_missing_file_is_allowed() {
        let settings = Settings::load("/nonexistent/watchproxy-config").unwrap();
        assert_eq!(settings.proxy.route, "/watch/proxy");
        assert_eq!(settings.proxy.forward_window(), 2 * default_heuristic_bitrate());
    }
}
