//! Content type detection from the leading bytes of a file.

/// Number of leading bytes inspected by [`detect_content_type`].
pub const SNIFF_LEN: usize = 512;

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const M3U8_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

const SIGNATURES: &[(&[u8], &str)] = &[
    (b"#EXTM3U", M3U8_CONTENT_TYPE),
    (b"\x1A\x45\xDF\xA3", "video/webm"),
    (b"OggS\x00", "application/ogg"),
    (b"ID3", "audio/mpeg"),
    (b"fLaC", "audio/flac"),
    (b"\x00\x00\x01\xBA", "video/mpeg"),
    (b"\x00\x00\x01\xB3", "video/mpeg"),
    (b"\x89PNG\x0D\x0A\x1A\x0A", "image/png"),
    (b"\xFF\xD8\xFF", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"%PDF-", "application/pdf"),
    (b"PK\x03\x04", "application/zip"),
    (b"WEBVTT", "text/vtt"),
];

/// Best-effort MIME type of `data`, falling back to `application/octet-stream`.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];

    if let Some((_, mime)) = SIGNATURES.iter().find(|(magic, _)| data.starts_with(magic)) {
        return mime;
    }
    if is_mp4(data) {
        return "video/mp4";
    }
    if data.len() >= 12 && &data[..4] == b"RIFF" {
        match &data[8..12] {
            b"AVI " => return "video/avi",
            b"WAVE" => return "audio/wave",
            b"WEBP" => return "image/webp",
            _ => {}
        }
    }
    if is_mpeg_ts(data) {
        return "video/mp2t";
    }
    if is_mp3_frame(data) {
        return "audio/mpeg";
    }
    if looks_like_text(data) {
        return "text/plain; charset=utf-8";
    }
    OCTET_STREAM
}

/// `ftyp` box at offset 4 with a sane box size.
fn is_mp4(data: &[u8]) -> bool {
    if data.len() < 12 || &data[4..8] != b"ftyp" {
        return false;
    }
    let box_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    box_size >= 8 && box_size % 4 == 0
}

/// Transport stream packets are 188 bytes, each starting with the 0x47 sync byte.
fn is_mpeg_ts(data: &[u8]) -> bool {
    const PACKET: usize = 188;
    if data.first() != Some(&0x47) {
        return false;
    }
    data.iter().step_by(PACKET).all(|&b| b == 0x47)
}

fn is_mp3_frame(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0xFF && data[1] & 0xE0 == 0xE0
}

fn looks_like_text(data: &[u8]) -> bool {
    !data.is_empty()
        && std::str::from_utf8(data).is_ok()
        && data
            .iter()
            .all(|&b| b >= 0x20 || matches!(b, b'\n' | b'\r' | b'\t'))
}

/// Extension of the path component of `url` including the dot, e.g. `.mp4`.
pub fn url_extension(url: &str) -> String {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split(['?', '#']).next().unwrap_or_default().to_string());
    let file = path.rsplit('/').next().unwrap_or_default();
    match file.rfind('.') {
        Some(dot) if dot + 1 < file.len() => file[dot..].to_ascii_lowercase(),
        _ => String::new(),
    }
}
