//! Upstream HTTP access shared by every proxy kind.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{HeaderValue, ORIGIN, RANGE, REFERER, USER_AGENT};
use reqwest::{RequestBuilder, Response};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, UpstreamError};
use crate::metrics;
use crate::sniff::SNIFF_LEN;

/// Playlists are text; anything larger than this is not a manifest we want.
pub const PLAYLIST_BODY_LIMIT: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadOptions<'a> {
    pub referer: Option<&'a str>,
    /// Abort with a timeout instead of waiting on a slow host.
    pub hasty: bool,
    pub body_limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    user_agent: String,
    hasty_timeout: Duration,
}

/// `scheme://host[:port]` of `referer`, sent as `Origin` alongside it.
pub fn infer_origin(referer: &str) -> Option<String> {
    let origin = url::Url::parse(referer).ok()?.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

impl Fetcher {
    pub fn new(config: &ProxyConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
            hasty_timeout: config.hasty_timeout(),
        })
    }

    fn request(&self, url: &str, referer: Option<&str>) -> RequestBuilder {
        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT, self.user_agent.as_str());

        if let Some(referer) = referer.filter(|r| !r.is_empty()) {
            if let Ok(value) = HeaderValue::from_str(referer) {
                request = request.header(REFERER, value);
            }
            if let Some(origin) = infer_origin(referer) {
                request = request.header(ORIGIN, origin);
            }
        }
        request
    }

    async fn send(&self, url: &str, request: RequestBuilder) -> Result<Response, UpstreamError> {
        let response = request
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status,
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    /// Plain GET that fails on any non-2xx status.
    pub async fn get(&self, url: &str, referer: Option<&str>) -> Result<Response, UpstreamError> {
        self.send(url, self.request(url, referer)).await
    }

    pub async fn fetch_text(&self, url: &str, referer: Option<&str>) -> Result<String, UpstreamError> {
        metrics::record_fetch("playlist");
        let response = self.get(url, referer).await?;
        let body = read_limited(url, response, PLAYLIST_BODY_LIMIT).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Reads at most the first 512 bytes of `url`, requiring a success status.
    pub async fn probe(&self, url: &str, referer: Option<&str>) -> Result<Bytes, UpstreamError> {
        let request = self.request(url, referer).timeout(self.hasty_timeout);
        let mut response = self.send(url, request).await?;
        let mut head = BytesMut::with_capacity(SNIFF_LEN);
        while head.len() < SNIFF_LEN {
            match response.chunk().await {
                Ok(Some(chunk)) => head.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) => return Err(UpstreamError::from_reqwest(url, e)),
            }
        }
        head.truncate(SNIFF_LEN);
        Ok(head.freeze())
    }

    /// Opens a streaming GET starting at byte `from`.
    pub async fn open_range(
        &self,
        url: &str,
        from: u64,
        referer: Option<&str>,
    ) -> Result<Response, UpstreamError> {
        metrics::record_fetch("generic");
        let request = self
            .request(url, referer)
            .header(RANGE, format!("bytes={from}-"));
        self.send(url, request).await
    }

    /// Fetches the inclusive byte range `[start, end]` in one request.
    pub async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
        referer: Option<&str>,
    ) -> Result<Bytes, UpstreamError> {
        metrics::record_fetch("generic");
        let request = self
            .request(url, referer)
            .header(RANGE, format!("bytes={start}-{end}"));
        let response = self.send(url, request).await?;
        read_limited(url, response, end - start + 1).await
    }

    /// Streams `url` into `path`, replacing any previous file only once the body is complete.
    pub async fn download_file(
        &self,
        url: &str,
        path: &Path,
        options: DownloadOptions<'_>,
    ) -> Result<u64, ProxyError> {
        let mut request = self.request(url, options.referer);
        if options.hasty {
            request = request.timeout(self.hasty_timeout);
        }
        let response = self.send(url, request).await?;

        if let (Some(limit), Some(length)) = (options.body_limit, response.content_length()) {
            if length > limit {
                return Err(UpstreamError::BodyTooLarge {
                    url: url.to_string(),
                    limit,
                }
                .into());
            }
        }

        let mut partial = path.as_os_str().to_owned();
        partial.push(".part");
        let partial = PathBuf::from(partial);
        let result = write_body(url, response, &partial, options.body_limit).await;
        match result {
            Ok(written) => {
                tokio::fs::rename(&partial, path).await?;
                debug!("Downloaded: url={} path={} bytes={}", url, path.display(), written);
                Ok(written)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }
}

async fn write_body(
    url: &str,
    response: Response,
    path: &Path,
    limit: Option<u64>,
) -> Result<u64, ProxyError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| UpstreamError::from_reqwest(url, e))?;
        written += chunk.len() as u64;
        if let Some(limit) = limit.filter(|&limit| written > limit) {
            return Err(UpstreamError::BodyTooLarge {
                url: url.to_string(),
                limit,
            }
            .into());
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(written)
}

async fn read_limited(url: &str, response: Response, limit: u64) -> Result<Bytes, UpstreamError> {
    let mut body = BytesMut::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| UpstreamError::from_reqwest(url, e))?;
        if (body.len() + chunk.len()) as u64 > limit {
            return Err(UpstreamError::BodyTooLarge {
                url: url.to_string(),
                limit,
            });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_origin() {
        assert_eq!(
            infer_origin("https://player.example.com/embed/123?x=1").as_deref(),
            Some("https://player.example.com")
        );
        assert_eq!(
            infer_origin("http://localhost:8080/a").as_deref(),
            Some("http://localhost:8080")
        );
        assert_eq!(infer_origin("not a url"), None);
    }
}
