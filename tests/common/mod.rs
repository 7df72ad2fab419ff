#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, HeaderMap, Request, StatusCode, Uri},
    response::Response,
    Router,
};
use bytes::Bytes;
use parking_lot::Mutex;
use tower::util::ServiceExt;
use watchproxy::{config::ProxyConfig, state::ProxyState};

#[derive(Clone)]
struct Resource {
    body: Bytes,
    status: StatusCode,
    delay: Duration,
}

#[derive(Default)]
struct Inner {
    resources: Mutex<HashMap<String, Resource>>,
    /// (path, Range header) of every request in arrival order.
    log: Mutex<Vec<(String, Option<String>)>>,
}

/// Local upstream host serving canned bodies with `Range` support.
#[derive(Clone)]
pub struct Upstream {
    pub base: String,
    inner: Arc<Inner>,
}

impl Upstream {
    pub async fn start() -> Self {
        let inner = Arc::new(Inner::default());
        let app = Router::new().fallback({
            let inner = inner.clone();
            move |uri: Uri, headers: HeaderMap| {
                let inner = inner.clone();
                async move { respond(&inner, uri, headers).await }
            }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            inner,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn put(&self, path: &str, body: impl Into<Bytes>) {
        self.put_with(path, body, StatusCode::OK, Duration::ZERO);
    }

    pub fn put_slow(&self, path: &str, body: impl Into<Bytes>, delay: Duration) {
        self.put_with(path, body, StatusCode::OK, delay);
    }

    pub fn put_status(&self, path: &str, status: StatusCode) {
        self.put_with(path, Bytes::new(), status, Duration::ZERO);
    }

    fn put_with(&self, path: &str, body: impl Into<Bytes>, status: StatusCode, delay: Duration) {
        self.inner.resources.lock().insert(
            path.to_string(),
            Resource {
                body: body.into(),
                status,
                delay,
            },
        );
    }

    pub fn hits(&self, path: &str) -> usize {
        self.inner.log.lock().iter().filter(|(p, _)| p == path).count()
    }

    pub fn ranges(&self, path: &str) -> Vec<Option<String>> {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, range)| range.clone())
            .collect()
    }
}

async fn respond(inner: &Inner, uri: Uri, headers: HeaderMap) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    inner.log.lock().push((uri.path().to_string(), range.clone()));

    let resource = inner.resources.lock().get(uri.path()).cloned();
    let Some(resource) = resource else {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("missing"))
            .unwrap();
    };
    if !resource.delay.is_zero() {
        tokio::time::sleep(resource.delay).await;
    }
    if !resource.status.is_success() {
        return Response::builder()
            .status(resource.status)
            .body(Body::from("upstream error"))
            .unwrap();
    }

    let len = resource.body.len() as u64;
    let requested = range.as_deref().and_then(|r| r.strip_prefix("bytes=")).and_then(|r| {
        let (start, end) = r.split_once('-')?;
        let start: u64 = start.parse().ok()?;
        let end: u64 = if end.is_empty() { len - 1 } else { end.parse::<u64>().ok()?.min(len - 1) };
        (start <= end).then_some((start, end))
    });

    match requested {
        Some((start, end)) => Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}"))
            .body(Body::from(resource.body.slice(start as usize..=end as usize)))
            .unwrap(),
        None => Response::builder()
            .status(StatusCode::OK)
            .body(Body::from(resource.body))
            .unwrap(),
    }
}

pub fn test_config(dir: &Path) -> ProxyConfig {
    ProxyConfig {
        content_dir: dir.to_path_buf(),
        hasty_timeout_secs: 5,
        ..ProxyConfig::default()
    }
}

pub fn proxy_state(config: ProxyConfig) -> Arc<ProxyState> {
    Arc::new(ProxyState::new(config).unwrap())
}

pub struct Fetched {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Fetched {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub async fn get(app: &Router, uri: &str, range: Option<&str>) -> Fetched {
    let mut request = Request::builder().uri(uri);
    if let Some(range) = range {
        request = request.header(header::RANGE, range);
    }
    let response = app
        .clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let body = http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes();
    Fetched {
        status,
        headers,
        body,
    }
}

/// Media playlist with `count` segments of `duration` seconds at `/{dir}/segN.ts`.
pub fn media_playlist(count: usize, duration: f64) -> String {
    let mut text = format!("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{}\n", duration.ceil());
    for i in 0..count {
        text.push_str(&format!("#EXTINF:{duration},\nseg{i}.ts\n"));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

/// Bytes that look like an MPEG-TS segment and identify `tag`.
pub fn ts_segment(tag: &str) -> Bytes {
    let mut data = vec![0u8; 188 * 4];
    for packet in data.chunks_mut(188) {
        packet[0] = 0x47;
        let tag = tag.as_bytes();
        packet[4..4 + tag.len()].copy_from_slice(tag);
    }
    Bytes::from(data)
}
