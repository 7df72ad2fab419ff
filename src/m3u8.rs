//! M3U8 (HLS) playlist model, parser and serializer.
//!
//! The parser is line oriented. Master playlists produce [`Track`]s and
//! [`AudioRendition`]s, media playlists produce [`Segment`]s. `#EXT-X-KEY`,
//! `#EXT-X-MAP` and any per-segment tag the parser does not interpret attach to
//! the next segment and are written back in front of it on serialization.
//!
//! Every URI keeps the upstream value it was parsed with next to the local name
//! it is served under once the proxy rewrites it (see [`MediaUri`]).

use std::fmt::Write as _;

use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

use crate::error::ParseError;

pub const EXTM3U: &str = "#EXTM3U";
pub const EXT_X_VERSION: &str = "EXT-X-VERSION";
pub const EXT_X_TARGETDURATION: &str = "EXT-X-TARGETDURATION";
pub const EXT_X_MEDIA_SEQUENCE: &str = "EXT-X-MEDIA-SEQUENCE";
pub const EXT_X_PLAYLIST_TYPE: &str = "EXT-X-PLAYLIST-TYPE";
pub const EXT_X_SESSION_DATA: &str = "EXT-X-SESSION-DATA";

const EXTINF: &str = "#EXTINF:";
const EXT_X_STREAM_INF: &str = "#EXT-X-STREAM-INF:";
const EXT_X_MEDIA: &str = "#EXT-X-MEDIA:";
const EXT_X_KEY: &str = "#EXT-X-KEY:";
const EXT_X_MAP: &str = "#EXT-X-MAP:";
const EXT_X_I_FRAME_STREAM_INF: &str = "#EXT-X-I-FRAME-STREAM-INF";
const ENDLIST_SUFFIX: &str = "-ENDLIST";

lazy_static! {
    static ref RESOLUTION_RE: Regex = Regex::new(r"^\s*(\d+)\s*[xX]\s*(\d+)\s*$").unwrap();
}

/// Tags that describe the whole playlist rather than the next segment.
const HEADER_TAGS: [&str; 10] = [
    EXT_X_VERSION,
    EXT_X_TARGETDURATION,
    EXT_X_MEDIA_SEQUENCE,
    "EXT-X-DISCONTINUITY-SEQUENCE",
    EXT_X_PLAYLIST_TYPE,
    EXT_X_SESSION_DATA,
    "EXT-X-SESSION-KEY",
    "EXT-X-INDEPENDENT-SEGMENTS",
    "EXT-X-START",
    "EXT-X-ALLOW-CACHE",
];

/// One `KEY=VALUE` field of an attribute list such as `BANDWIDTH=1,CODECS="a,b"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub key: String,
    pub value: String,
    pub quoted: bool,
}

/// Splits an attribute list into its fields.
///
/// Commas inside double quotes belong to the value. Fields without a key are
/// skipped and an unterminated quote swallows the rest of the input.
pub fn parse_params(input: &str) -> Vec<Param> {
    let mut params = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        let Some(split) = rest.find(['=', ',']) else {
            break;
        };
        if rest[split..].starts_with(',') {
            rest = &rest[split + 1..];
            continue;
        }

        let key = rest[..split].trim();
        let after_key = &rest[split + 1..];

        let (value, quoted, remaining) = match after_key.strip_prefix('"') {
            Some(quoted_value) => match quoted_value.find('"') {
                Some(end) => {
                    let tail = &quoted_value[end + 1..];
                    let tail = tail.find(',').map_or("", |comma| &tail[comma + 1..]);
                    (&quoted_value[..end], true, tail)
                }
                None => (quoted_value, true, ""),
            },
            None => match after_key.find(',') {
                Some(comma) => (&after_key[..comma], false, &after_key[comma + 1..]),
                None => (after_key, false, ""),
            },
        };

        if !key.is_empty() {
            params.push(Param {
                key: key.to_string(),
                value: value.to_string(),
                quoted,
            });
        }
        rest = remaining;
    }

    params
}

pub fn param_value<'a>(key: &str, params: &'a [Param]) -> Option<&'a str> {
    params
        .iter()
        .find(|p| p.key == key)
        .map(|p| p.value.as_str())
}

fn set_param(params: &mut Vec<Param>, key: &str, value: &str) {
    match params.iter_mut().find(|p| p.key == key) {
        Some(param) => param.value = value.to_string(),
        None => params.push(Param {
            key: key.to_string(),
            value: value.to_string(),
            quoted: true,
        }),
    }
}

pub fn serialize_params(params: &[Param]) -> String {
    let mut out = String::new();
    for (i, param) in params.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        if param.quoted {
            let _ = write!(out, "{}=\"{}\"", param.key, param.value);
        } else {
            let _ = write!(out, "{}={}", param.key, param.value);
        }
    }
    out
}

pub fn is_absolute(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Resolves `raw` against `base` unless it is already absolute.
pub fn make_absolute(raw: &str, base: &Url) -> String {
    if is_absolute(raw) {
        return raw.to_string();
    }
    match base.join(raw) {
        Ok(joined) => joined.to_string(),
        Err(_) => raw.to_string(),
    }
}

/// A URI as published upstream plus the local name it is served under, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaUri {
    pub original: String,
    pub local: Option<String>,
}

impl MediaUri {
    pub fn new(original: impl Into<String>) -> Self {
        Self {
            original: original.into(),
            local: None,
        }
    }

    /// The value written into a serialized playlist.
    pub fn served(&self) -> &str {
        self.local.as_deref().unwrap_or(&self.original)
    }

    pub fn localize(&mut self, name: impl Into<String>) {
        self.local = Some(name.into());
    }

    fn prefix(&mut self, base: &Url) {
        self.original = make_absolute(&self.original, base);
    }
}

/// Attribute list of a tag that may carry a `URI` (`#EXT-X-MEDIA`, `#EXT-X-KEY`, `#EXT-X-MAP`).
#[derive(Debug, Clone, PartialEq)]
pub struct UriAttributes {
    pub params: Vec<Param>,
    pub uri: Option<MediaUri>,
}

impl UriAttributes {
    pub fn parse(raw: &str) -> Self {
        let params = parse_params(raw);
        let uri = param_value("URI", &params)
            .filter(|uri| !uri.is_empty())
            .map(MediaUri::new);
        Self { params, uri }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        param_value(key, &self.params)
    }

    fn serialize(&self) -> String {
        match &self.uri {
            Some(uri) => {
                let mut params = self.params.clone();
                set_param(&mut params, "URI", uri.served());
                serialize_params(&params)
            }
            None => serialize_params(&self.params),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn parse(raw: &str) -> Option<Self> {
        let caps = RESOLUTION_RE.captures(raw)?;
        Some(Self {
            width: caps[1].parse().ok()?,
            height: caps[2].parse().ok()?,
        })
    }
}

/// A variant stream of a master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub uri: MediaUri,
    pub stream_info: Vec<Param>,
    pub resolution: Option<Resolution>,
}

impl Track {
    pub fn new(uri: impl Into<String>, stream_info: Vec<Param>) -> Self {
        let resolution = param_value("RESOLUTION", &stream_info).and_then(Resolution::parse);
        Self {
            uri: MediaUri::new(uri),
            stream_info,
            resolution,
        }
    }

    pub fn height(&self) -> u32 {
        self.resolution.map_or(0, |r| r.height)
    }

    pub fn audio_group(&self) -> Option<&str> {
        param_value("AUDIO", &self.stream_info).filter(|group| !group.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioRendition {
    pub attributes: UriAttributes,
}

impl AudioRendition {
    pub fn group_id(&self) -> Option<&str> {
        self.attributes.get("GROUP-ID")
    }

    pub fn name(&self) -> &str {
        self.attributes.get("NAME").unwrap_or_default()
    }

    pub fn is_default(&self) -> bool {
        self.attributes.get("DEFAULT") == Some("YES")
    }

    pub fn uri(&self) -> Option<&MediaUri> {
        self.attributes.uri.as_ref()
    }
}

/// A media segment together with the tags that precede it.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub uri: MediaUri,
    pub duration: f64,
    pub title: String,
    pub key: Option<UriAttributes>,
    pub map: Option<UriAttributes>,
    /// Tags the parser does not interpret, kept verbatim.
    pub tags: Vec<String>,
}

impl Segment {
    pub fn key_uri(&self) -> Option<&MediaUri> {
        self.key.as_ref().and_then(|key| key.uri.as_ref())
    }

    pub fn map_uri(&self) -> Option<&MediaUri> {
        self.map.as_ref().and_then(|map| map.uri.as_ref())
    }

    pub fn key_uri_mut(&mut self) -> Option<&mut MediaUri> {
        self.key.as_mut().and_then(|key| key.uri.as_mut())
    }

    pub fn map_uri_mut(&mut self) -> Option<&mut MediaUri> {
        self.map.as_mut().and_then(|map| map.uri.as_mut())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub key: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Playlist {
    /// Location the playlist was obtained from, used as the base for relative URIs.
    pub url: String,
    pub is_master: bool,
    pub is_live: bool,
    pub attributes: Vec<Attribute>,
    pub tracks: Vec<Track>,
    pub audio_renditions: Vec<AudioRendition>,
    pub segments: Vec<Segment>,
}

#[derive(Default)]
struct PendingTags {
    key: Option<UriAttributes>,
    map: Option<UriAttributes>,
    tags: Vec<String>,
}

fn parse_extinf(rest: &str) -> Option<(f64, String)> {
    let (duration, title) = match rest.split_once(',') {
        Some((duration, title)) => (duration, title),
        None => (rest, ""),
    };
    let duration: f64 = duration.trim().parse().ok()?;
    if !duration.is_finite() || duration < 0.0 {
        return None;
    }
    Some((duration, title.to_string()))
}

/// Returns the next URI line; tag lines met on the way are collected into `tags`.
fn next_uri<'a>(
    lines: &mut impl Iterator<Item = &'a str>,
    tags: &mut Vec<String>,
) -> Option<&'a str> {
    for line in lines {
        if line.starts_with("#EXT") {
            tags.push(line.to_string());
        } else if !line.starts_with('#') {
            return Some(line);
        }
    }
    None
}

fn split_tag(line: &str) -> (&str, Option<&str>) {
    let tag = &line[1..];
    match tag.split_once(':') {
        Some((key, value)) => (key, Some(value)),
        None => (tag, None),
    }
}

pub fn parse(input: &str) -> Result<Playlist, ParseError> {
    let mut lines = input
        .lines()
        .map(|line| line.trim_start_matches('\u{feff}').trim())
        .filter(|line| !line.is_empty());

    match lines.next() {
        Some(first) if first.starts_with(EXTM3U) => {}
        _ => return Err(ParseError::MissingHeader),
    }

    let mut playlist = Playlist::default();
    let mut pending = PendingTags::default();
    let mut ended = false;

    while let Some(line) = lines.next() {
        if let Some(rest) = line.strip_prefix(EXTINF) {
            let (duration, title) = parse_extinf(rest).ok_or_else(|| ParseError::InvalidDuration {
                line: line.to_string(),
            })?;
            let uri = next_uri(&mut lines, &mut pending.tags)
                .ok_or(ParseError::MissingUri { tag: "#EXTINF" })?;
            playlist.segments.push(Segment {
                uri: MediaUri::new(uri),
                duration,
                title,
                key: pending.key.take(),
                map: pending.map.take(),
                tags: std::mem::take(&mut pending.tags),
            });
        } else if let Some(rest) = line.strip_prefix(EXT_X_STREAM_INF) {
            let mut skipped = Vec::new();
            let uri = next_uri(&mut lines, &mut skipped).ok_or(ParseError::MissingUri {
                tag: "#EXT-X-STREAM-INF",
            })?;
            playlist.tracks.push(Track::new(uri, parse_params(rest)));
        } else if let Some(rest) = line.strip_prefix(EXT_X_MEDIA) {
            let attributes = UriAttributes::parse(rest);
            if attributes.get("TYPE") == Some("AUDIO") {
                playlist.audio_renditions.push(AudioRendition { attributes });
            }
        } else if let Some(rest) = line.strip_prefix(EXT_X_KEY) {
            pending.key = Some(UriAttributes::parse(rest));
        } else if let Some(rest) = line.strip_prefix(EXT_X_MAP) {
            pending.map = Some(UriAttributes::parse(rest));
        } else if line.starts_with("#EXT") && line.ends_with(ENDLIST_SUFFIX) {
            ended = true;
            break;
        } else if line.starts_with(EXT_X_I_FRAME_STREAM_INF) {
            continue;
        } else if line.starts_with("#EXT") {
            let (key, value) = split_tag(line);
            if HEADER_TAGS.contains(&key) {
                playlist.attributes.push(Attribute {
                    key: key.to_string(),
                    value: value.map(str::to_string),
                });
            } else {
                pending.tags.push(line.to_string());
            }
        }
        // Plain comments and URIs without a preceding tag are ignored.
    }

    let has_variants = !playlist.tracks.is_empty() || !playlist.audio_renditions.is_empty();
    if has_variants && !playlist.segments.is_empty() {
        return Err(ParseError::MixedPlaylist);
    }

    playlist.is_master = !playlist.tracks.is_empty();
    playlist.is_live = !playlist.is_master
        && !ended
        && playlist.get_attribute(EXT_X_PLAYLIST_TYPE) != Some("VOD");
    Ok(playlist)
}

impl Playlist {
    pub fn parse_from(url: impl Into<String>, input: &str) -> Result<Self, ParseError> {
        let mut playlist = parse(input)?;
        playlist.url = url.into();
        Ok(playlist)
    }

    pub fn get_attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.key == key)
            .and_then(|attr| attr.value.as_deref())
    }

    pub fn media_sequence(&self) -> u64 {
        self.get_attribute(EXT_X_MEDIA_SEQUENCE)
            .and_then(|seq| seq.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// Drops the final segment when it is shorter than `min_length` seconds.
    pub fn remove_trailing_segment(&mut self, min_length: f64) -> bool {
        if self.segments.len() < 2 {
            return false;
        }
        match self.segments.last() {
            Some(last) if last.duration < min_length => {
                self.segments.pop();
                true
            }
            _ => false,
        }
    }

    /// Makes every relative URI absolute using the playlist's own URL as the base.
    pub fn prefix_relative_uris(&mut self) {
        let Ok(base) = Url::parse(&self.url) else {
            return;
        };
        for track in &mut self.tracks {
            track.uri.prefix(&base);
        }
        for rendition in &mut self.audio_renditions {
            if let Some(uri) = rendition.attributes.uri.as_mut() {
                uri.prefix(&base);
            }
        }
        for segment in &mut self.segments {
            segment.uri.prefix(&base);
            if let Some(uri) = segment.key_uri_mut() {
                uri.prefix(&base);
            }
            if let Some(uri) = segment.map_uri_mut() {
                uri.prefix(&base);
            }
        }
    }

    /// Index of the highest track by video height; the first declared wins a tie.
    ///
    /// When `filter` rejects every track the selection falls back to all tracks.
    pub fn best_track(&self, filter: Option<&dyn Fn(&Track) -> bool>) -> Option<usize> {
        if let Some(filter) = filter {
            let best = highest(self.tracks.iter().enumerate().filter(|(_, t)| filter(t)));
            if best.is_some() {
                return best;
            }
        }
        highest(self.tracks.iter().enumerate())
    }

    /// Highest track not taller than `max_height`, else the best track overall.
    pub fn track_by_video_height(&self, max_height: u32) -> Option<usize> {
        highest(
            self.tracks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.height() <= max_height),
        )
        .or_else(|| self.best_track(None))
    }

    /// Audio rendition for `group_id`: `DEFAULT=YES` first, then a name containing
    /// "original", then the first declared match.
    pub fn audio_rendition_for_group(&self, group_id: &str) -> Option<usize> {
        let matching: Vec<usize> = self
            .audio_renditions
            .iter()
            .enumerate()
            .filter(|(_, r)| r.group_id() == Some(group_id))
            .map(|(i, _)| i)
            .collect();

        matching
            .iter()
            .copied()
            .find(|&i| self.audio_renditions[i].is_default())
            .or_else(|| {
                matching.iter().copied().find(|&i| {
                    self.audio_renditions[i]
                        .name()
                        .to_lowercase()
                        .contains("original")
                })
            })
            .or_else(|| matching.first().copied())
    }

    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(64 + self.segments.len() * 48);
        out.push_str(EXTM3U);
        out.push('\n');

        for attr in &self.attributes {
            match &attr.value {
                Some(value) => {
                    let _ = writeln!(out, "#{}:{}", attr.key, value);
                }
                None => {
                    let _ = writeln!(out, "#{}", attr.key);
                }
            }
        }

        if self.is_master {
            for rendition in &self.audio_renditions {
                let _ = writeln!(out, "{}{}", EXT_X_MEDIA, rendition.attributes.serialize());
            }
            for track in &self.tracks {
                let _ = writeln!(
                    out,
                    "{}{}\n{}",
                    EXT_X_STREAM_INF,
                    serialize_params(&track.stream_info),
                    track.uri.served()
                );
            }
            return out;
        }

        for segment in &self.segments {
            for tag in &segment.tags {
                out.push_str(tag);
                out.push('\n');
            }
            if let Some(key) = &segment.key {
                let _ = writeln!(out, "{}{}", EXT_X_KEY, key.serialize());
            }
            if let Some(map) = &segment.map {
                let _ = writeln!(out, "{}{}", EXT_X_MAP, map.serialize());
            }
            let _ = writeln!(
                out,
                "{}{},{}\n{}",
                EXTINF,
                segment.duration,
                segment.title,
                segment.uri.served()
            );
        }

        if !self.is_live {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        out
    }
}

fn highest<'a>(tracks: impl Iterator<Item = (usize, &'a Track)>) -> Option<usize> {
    let mut best: Option<(usize, u32)> = None;
    for (index, track) in tracks {
        let height = track.height();
        if best.is_none_or(|(_, best_height)| height > best_height) {
            best = Some((index, height));
        }
    }
    best.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = r#"#EXTM3U
#EXT-X-VERSION:4
#EXT-X-INDEPENDENT-SEGMENTS
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=854x480,CODECS="avc1.4d401e,mp4a.40.2"
480/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=1400000,RESOLUTION=1280x720,CODECS="avc1.4d401f,mp4a.40.2"
720/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2800000,RESOLUTION=1920x1080,CODECS="avc1.640028,mp4a.40.2"
1080/index.m3u8
"#;

    const MEDIA: &str = r#"#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:10
#EXT-X-MEDIA-SEQUENCE:0
#EXT-X-PLAYLIST-TYPE:VOD
#EXT-X-KEY:METHOD=AES-128,URI="keys/k1.bin",IV=0x1f
#EXT-X-MAP:URI="init.mp4"
#EXTINF:10.0,
seg0.ts
#EXTINF:9.5,intro
#EXT-X-BYTERANGE:1000@0
seg1.ts
#EXT-X-DISCONTINUITY
#EXTINF:4.2,
https://cdn.example.com/seg2.ts
#EXT-X-ENDLIST
"#;

    #[test]
    fn test_stringed_param_with_commas() {
        let params = parse_params("CODECS=\"avc1.4d4028,mp4a.40.2,stpp.ttml.im1t\",RESOLUTION=1920x800");
        assert_eq!(param_value("RESOLUTION", &params), Some("1920x800"));
        assert_eq!(
            param_value("CODECS", &params),
            Some("avc1.4d4028,mp4a.40.2,stpp.ttml.im1t")
        );
    }

    #[test]
    fn test_last_and_misc_params() {
        let params = parse_params("FRAME-RATE=24.000,LAST=\"last\"");
        assert_eq!(param_value("LAST", &params), Some("last"));

        let params = parse_params(
            "BANDWIDTH=6725464,AVERAGE-BANDWIDTH=6296707,CODECS=\"avc1.4d4028,mp4a.40.2,stpp.ttml.im1t\",RESOLUTION=1920x800,FRAME-RATE=24.000,AUDIO=\"audio\"",
        );
        assert_eq!(params.len(), 6);
        assert_eq!(param_value("AUDIO", &params), Some("audio"));
    }

    #[test]
    fn test_utf8_params() {
        let params = parse_params("NAME=\"Ján的\",K=V");
        assert_eq!(param_value("NAME", &params), Some("Ján的"));
        assert_eq!(param_value("K", &params), Some("V"));
    }

    #[test]
    fn test_malformed_params_dont_crash() {
        assert!(parse_params("=V").is_empty());
        assert!(parse_params("").is_empty());
        assert!(parse_params(",,,").is_empty());

        let params = parse_params("K=V,");
        assert_eq!(params.len(), 1);
        assert_eq!(param_value("K", &params), Some("V"));

        let params = parse_params("A=\"unterminated,B=2");
        assert_eq!(params.len(), 1);
        assert_eq!(param_value("A", &params), Some("unterminated,B=2"));

        let params = parse_params("FLAG,K=V");
        assert_eq!(params.len(), 1);
        assert_eq!(param_value("K", &params), Some("V"));
    }

    #[test]
    fn test_parse_master() {
        let playlist = parse(MASTER).unwrap();
        assert!(playlist.is_master);
        assert!(!playlist.is_live);
        assert_eq!(playlist.tracks.len(), 3);
        assert!(playlist.segments.is_empty());
        assert_eq!(playlist.tracks[1].resolution, Some(Resolution { width: 1280, height: 720 }));
        assert_eq!(playlist.get_attribute(EXT_X_VERSION), Some("4"));
        assert_eq!(playlist.attributes[1].key, "EXT-X-INDEPENDENT-SEGMENTS");
        assert_eq!(playlist.attributes[1].value, None);
    }

    #[test]
    fn test_best_track_picks_highest_resolution() {
        let playlist = parse(MASTER).unwrap();
        let best = playlist.best_track(None).unwrap();
        assert_eq!(playlist.tracks[best].height(), 1080);
        assert_eq!(playlist.tracks[best].uri.original, "1080/index.m3u8");

        let under_720 = playlist.track_by_video_height(720).unwrap();
        assert_eq!(playlist.tracks[under_720].height(), 720);
        let too_small = playlist.track_by_video_height(100).unwrap();
        assert_eq!(playlist.tracks[too_small].height(), 1080);
    }

    #[test]
    fn test_best_track_tie_keeps_declaration_order() {
        let input = "#EXTM3U\n#EXT-X-STREAM-INF:RESOLUTION=1280x720\na.m3u8\n#EXT-X-STREAM-INF:RESOLUTION=1280x720\nb.m3u8\n";
        let playlist = parse(input).unwrap();
        assert_eq!(playlist.best_track(None), Some(0));
    }

    #[test]
    fn test_best_track_filter_falls_back() {
        let playlist = parse(MASTER).unwrap();
        let only_480 = |t: &Track| t.height() == 480;
        assert_eq!(playlist.best_track(Some(&only_480)), Some(0));
        let nothing = |_: &Track| false;
        assert_eq!(playlist.best_track(Some(&nothing)), Some(2));
    }

    #[test]
    fn test_parse_media_attaches_tags_to_next_segment() {
        let playlist = parse(MEDIA).unwrap();
        assert!(!playlist.is_master);
        assert!(!playlist.is_live);
        assert_eq!(playlist.segments.len(), 3);

        let first = &playlist.segments[0];
        assert_eq!(first.key_uri().unwrap().original, "keys/k1.bin");
        assert_eq!(first.key.as_ref().unwrap().get("IV"), Some("0x1f"));
        assert_eq!(first.map_uri().unwrap().original, "init.mp4");

        let second = &playlist.segments[1];
        assert!(second.key.is_none());
        assert_eq!(second.title, "intro");
        assert_eq!(second.tags, vec!["#EXT-X-BYTERANGE:1000@0".to_string()]);

        let third = &playlist.segments[2];
        assert_eq!(third.tags, vec!["#EXT-X-DISCONTINUITY".to_string()]);
        assert!((playlist.total_duration() - 23.7).abs() < 1e-9);
    }

    #[test]
    fn test_live_detection() {
        let live = "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:41\n#EXTINF:2.0,\na.ts\n";
        let playlist = parse(live).unwrap();
        assert!(playlist.is_live);
        assert_eq!(playlist.media_sequence(), 41);
        assert!(!playlist.serialize().contains("ENDLIST"));

        let vod_type = "#EXTM3U\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXTINF:2.0,\na.ts\n";
        assert!(!parse(vod_type).unwrap().is_live);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse("not a playlist"), Err(ParseError::MissingHeader));
        assert_eq!(parse(""), Err(ParseError::MissingHeader));
        assert_eq!(
            parse("#EXTM3U\n#EXTINF:abc,\na.ts\n"),
            Err(ParseError::InvalidDuration {
                line: "#EXTINF:abc,".to_string()
            })
        );
        assert_eq!(
            parse("#EXTM3U\n#EXTINF:2.0,\n"),
            Err(ParseError::MissingUri { tag: "#EXTINF" })
        );
        assert_eq!(
            parse("#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\na.m3u8\n#EXTINF:2.0,\nb.ts\n"),
            Err(ParseError::MixedPlaylist)
        );
    }

    #[test]
    fn test_round_trip_media() {
        let playlist = parse(MEDIA).unwrap();
        let reparsed = parse(&playlist.serialize()).unwrap();
        assert_eq!(reparsed.segments, playlist.segments);
        assert_eq!(reparsed.attributes, playlist.attributes);
        assert_eq!(reparsed.is_live, playlist.is_live);
    }

    #[test]
    fn test_round_trip_master_with_audio() {
        let input = r#"#EXTM3U
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="aud",NAME="English",DEFAULT=YES,URI="audio/en.m3u8"
#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1920x1080,CODECS="avc1.640028,mp4a.40.2",AUDIO="aud"
video/1080.m3u8
"#;
        let playlist = parse(input).unwrap();
        let reparsed = parse(&playlist.serialize()).unwrap();
        assert_eq!(reparsed.tracks, playlist.tracks);
        assert_eq!(reparsed.audio_renditions, playlist.audio_renditions);
        assert_eq!(reparsed.attributes, playlist.attributes);
    }

    #[test]
    fn test_serialize_uses_local_names() {
        let mut playlist = parse(MEDIA).unwrap();
        for (i, segment) in playlist.segments.iter_mut().enumerate() {
            segment.uri.localize(format!("vi-{i}"));
        }
        playlist.segments[0].key_uri_mut().unwrap().localize("decrypt.key");

        let text = playlist.serialize();
        assert!(text.contains("\nvi-0\n"));
        assert!(text.contains("\nvi-2\n"));
        assert!(!text.contains("seg0.ts"));
        assert!(text.contains("#EXT-X-KEY:METHOD=AES-128,URI=\"decrypt.key\",IV=0x1f"));
        // Originals stay available for fetching.
        assert_eq!(playlist.segments[0].uri.original, "seg0.ts");
    }

    #[test]
    fn test_prefix_relative_uris() {
        let mut playlist = Playlist::parse_from("https://host.example/vod/list/index.m3u8?token=1", MEDIA).unwrap();
        playlist.prefix_relative_uris();
        assert_eq!(playlist.segments[0].uri.original, "https://host.example/vod/list/seg0.ts");
        assert_eq!(
            playlist.segments[0].key_uri().unwrap().original,
            "https://host.example/vod/list/keys/k1.bin"
        );
        assert_eq!(playlist.segments[2].uri.original, "https://cdn.example.com/seg2.ts");

        let mut rooted = Playlist::parse_from(
            "https://host.example/a/b.m3u8",
            "#EXTM3U\n#EXTINF:1,\n/root/seg.ts\n",
        )
        .unwrap();
        rooted.prefix_relative_uris();
        assert_eq!(rooted.segments[0].uri.original, "https://host.example/root/seg.ts");
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!(Resolution::parse("1920x1080"), Some(Resolution { width: 1920, height: 1080 }));
        assert_eq!(Resolution::parse(" 640 X 360 "), Some(Resolution { width: 640, height: 360 }));
        assert_eq!(Resolution::parse("1920x"), None);
        assert_eq!(Resolution::parse("hd"), None);
    }

    #[test]
    fn test_remove_trailing_segment() {
        let mut playlist = parse("#EXTM3U\n#EXTINF:6,\na.ts\n#EXTINF:0.01,\nb.ts\n#EXT-X-ENDLIST\n").unwrap();
        assert!(playlist.remove_trailing_segment(0.038));
        assert_eq!(playlist.segments.len(), 1);
        assert!(!playlist.remove_trailing_segment(0.038));
    }

    #[test]
    fn test_audio_rendition_selection() {
        let input = r#"#EXTM3U
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="grp1",NAME="Dub",URI="dub.m3u8"
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="grp1",NAME="Main",DEFAULT=YES,URI="main.m3u8"
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="grp2",NAME="English original",URI="orig.m3u8"
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="grp2",NAME="French",URI="fr.m3u8"
#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID="subs",NAME="English",URI="subs.m3u8"
#EXT-X-STREAM-INF:BANDWIDTH=1,RESOLUTION=1920x1080,AUDIO="grp1"
v.m3u8
"#;
        let playlist = parse(input).unwrap();
        assert_eq!(playlist.audio_renditions.len(), 4);
        assert_eq!(playlist.audio_rendition_for_group("grp1"), Some(1));
        assert_eq!(playlist.audio_rendition_for_group("grp2"), Some(2));
        assert_eq!(playlist.audio_rendition_for_group("missing"), None);
    }
}
