//! Byte-range proxy for plain remote files.
//!
//! One upstream download feeds a sparse local copy of the file. Clients read
//! whatever is already on disk, ride the running download when it is just
//! ahead of them, or move the download to where they are. A background loop
//! pulls one window per iteration at a heuristic bitrate and stops pulling
//! while too much has been fetched ahead of estimated playback.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, UpstreamError};
use crate::fetch::Fetcher;
use crate::metrics;
use crate::range::{parse_range_header, DiskRange, Overlap, RangeList};
use crate::sniff::{detect_content_type, url_extension, SNIFF_LEN};

const PULL_INTERVAL: Duration = Duration::from_millis(100);
const IDLE_INTERVAL: Duration = Duration::from_secs(1);
const CLIENT_WAIT: Duration = Duration::from_secs(2);
const CLIENT_BUFFER: usize = 4;

/// Broadcast wake-up: every waiter registered before [`Wakeup::wake_all`] is released.
#[derive(Debug, Default)]
pub struct Wakeup {
    notify: Notify,
}

impl Wakeup {
    /// Registration must happen before the condition is checked, otherwise a wake
    /// between the check and the wait is lost; the bounded wait covers that anyway.
    pub fn listener(&self) -> Notified<'_> {
        self.notify.notified()
    }

    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    /// Waits for the next wake-up; `false` when `timeout` elapsed first.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.listener()).await.is_ok()
    }
}

/// Tunables copied out of [`ProxyConfig`] at setup.
#[derive(Debug, Clone, Copy)]
struct Limits {
    bitrate: u64,
    max_preload: u64,
    forward_window: u64,
    pre_offset: u64,
    chunk_size: u64,
}

impl Limits {
    fn from_config(config: &ProxyConfig) -> Self {
        Self {
            bitrate: config.heuristic_bitrate.max(1),
            max_preload: config.max_preload,
            forward_window: config.forward_window(),
            pre_offset: config.pre_offset,
            chunk_size: config.generic_chunk_size.max(1),
        }
    }
}

/// Bytes pulled ahead of a simulated playback clock running at the heuristic bitrate.
#[derive(Debug)]
struct Preload {
    bytes: u64,
    tick: Instant,
}

impl Preload {
    fn new() -> Self {
        Self {
            bytes: 0,
            tick: Instant::now(),
        }
    }

    fn consume(&mut self, bitrate: u64) {
        let now = Instant::now();
        let consumed = now.duration_since(self.tick).as_secs_f64() * bitrate as f64;
        self.bytes = self.bytes.saturating_sub(consumed as u64);
        self.tick = now;
    }

    fn reset(&mut self) {
        self.bytes = 0;
        self.tick = Instant::now();
    }
}

struct DownloadState {
    response: Option<reqwest::Response>,
    /// Where the next pulled byte goes.
    offset: u64,
    preload: Preload,
    /// Bytes received from the response beyond the last pulled window.
    carry: BytesMut,
}

struct Downloader {
    state: Mutex<DownloadState>,
    wake: Wakeup,
    closed: AtomicBool,
}

pub struct FileProxy {
    url: String,
    referer: Option<String>,
    content_length: u64,
    content_type: String,
    filename: String,
    path: PathBuf,
    file: Mutex<File>,
    ranges: parking_lot::Mutex<RangeList>,
    downloader: Downloader,
    fetcher: Fetcher,
    limits: Limits,
    stop: watch::Sender<bool>,
}

/// Total size from `Content-Range: bytes 0-N/TOTAL`, else `Content-Length`.
fn total_length(response: &reqwest::Response) -> Option<u64> {
    let from_range = response
        .headers()
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit_once('/'))
        .and_then(|(_, total)| total.trim().parse().ok());
    from_range.or_else(|| {
        (response.status() == StatusCode::OK)
            .then(|| response.content_length())
            .flatten()
    })
}

impl FileProxy {
    /// Opens the upstream file at offset 0, sniffs its type, allocates the local copy
    /// under `dir` and starts the download loop.
    pub async fn open(
        url: &str,
        referer: Option<&str>,
        dir: &Path,
        fetcher: Fetcher,
        config: &ProxyConfig,
    ) -> Result<Arc<Self>, ProxyError> {
        let mut response = fetcher.open_range(url, 0, referer).await?;
        let content_length = total_length(&response).ok_or_else(|| {
            ProxyError::resolution(format!("{url} does not report a content length"))
        })?;
        if content_length == 0 {
            return Err(ProxyError::resolution(format!("{url} is empty")));
        }
        if content_length > config.file_size_limit {
            return Err(ProxyError::TooLarge {
                size: content_length,
                limit: config.file_size_limit,
            });
        }

        let mut carry = BytesMut::new();
        while carry.len() < SNIFF_LEN {
            match response.chunk().await {
                Ok(Some(chunk)) => carry.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) => return Err(UpstreamError::from_reqwest(url, e).into()),
            }
        }
        let content_type = detect_content_type(&carry).to_string();
        let filename = format!("proxy{}", url_extension(url));
        let path = dir.join(&filename);

        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(content_length).await?;

        let (stop, stop_rx) = watch::channel(false);
        let proxy = Arc::new(Self {
            url: url.to_string(),
            referer: referer.map(str::to_string),
            content_length,
            content_type,
            filename,
            path,
            file: Mutex::new(file),
            ranges: parking_lot::Mutex::new(RangeList::new()),
            downloader: Downloader {
                state: Mutex::new(DownloadState {
                    response: Some(response),
                    offset: 0,
                    preload: Preload::new(),
                    carry,
                }),
                wake: Wakeup::default(),
                closed: AtomicBool::new(false),
            },
            fetcher,
            limits: Limits::from_config(config),
            stop,
        });

        if config.trailing_pull_size > 0 && content_length > config.trailing_pull_size {
            proxy.preload_trailing(config.trailing_pull_size).await;
        }

        info!(
            "Generic proxy ready: url={} length={} type={} file={}",
            proxy.url, content_length, proxy.content_type, proxy.filename
        );
        tokio::spawn(download_loop(Arc::downgrade(&proxy), stop_rx));
        Ok(proxy)
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn is_closed(&self) -> bool {
        self.downloader.closed.load(Ordering::Acquire)
    }

    /// Stops the download loop and releases waiting clients.
    pub fn close(&self) {
        self.downloader.closed.store(true, Ordering::Release);
        let _ = self.stop.send(true);
        self.downloader.wake.wake_all();
    }

    /// Container indexes often sit at the end of the file; fetch that tail up front.
    async fn preload_trailing(&self, size: u64) {
        let start = self.content_length - size;
        let end = self.content_length - 1;
        let bytes = match self
            .fetcher
            .fetch_range(&self.url, start, end, self.referer.as_deref())
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Trailing preload failed: url={} err={}", self.url, e);
                return;
            }
        };
        if bytes.len() as u64 != size {
            warn!(
                "Trailing preload returned unexpected size: url={} expected={} got={}",
                self.url,
                size,
                bytes.len()
            );
            return;
        }
        if let Err(e) = self.store(start, &bytes).await {
            warn!("Failed to store trailing preload: path={} err={}", self.path.display(), e);
        }
    }

    async fn store(&self, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        {
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
        }
        self.ranges
            .lock()
            .insert(DiskRange::new(offset, offset + bytes.len() as u64 - 1));
        Ok(())
    }

    async fn read(&self, range: DiskRange) -> std::io::Result<Bytes> {
        let mut buffer = vec![0u8; range.len() as usize];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(range.start)).await?;
        file.read_exact(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }

    /// Where a new download for a request at `start` should begin: a little earlier
    /// when the bytes right before `start` are not cached yet.
    fn prefetch_start(&self, start: u64) -> u64 {
        if start == 0 {
            return 0;
        }
        let pre_start = start.saturating_sub(self.limits.pre_offset);
        if self
            .ranges
            .lock()
            .contains(&DiskRange::new(pre_start, start - 1))
        {
            start
        } else {
            pre_start
        }
    }

    /// Drops the current upstream response and opens a new one at `from`.
    async fn replace_download(&self, state: &mut DownloadState, from: u64) -> Result<(), ProxyError> {
        state.response = None;
        state.carry.clear();
        if from < state.offset {
            state.preload.reset();
        }
        state.offset = from;

        let result = self
            .fetcher
            .open_range(&self.url, from, self.referer.as_deref())
            .await;
        let outcome = match result {
            Ok(response) if from > 0 && response.status() != StatusCode::PARTIAL_CONTENT => {
                Err(ProxyError::resolution(format!(
                    "{} ignored a range request at {}",
                    self.url, from
                )))
            }
            Ok(response) => {
                state.response = Some(response);
                Ok(())
            }
            Err(e) => Err(e.into()),
        };
        self.downloader.wake.wake_all();
        outcome
    }

    /// Reads exactly `count` bytes from the active response, or fewer at end of body.
    async fn pull(&self, state: &mut DownloadState, count: u64) -> Result<Bytes, ProxyError> {
        let count = count as usize;
        let response = state
            .response
            .as_mut()
            .ok_or_else(|| ProxyError::resolution("no active download"))?;
        while state.carry.len() < count {
            match response.chunk().await {
                Ok(Some(chunk)) => state.carry.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) => return Err(UpstreamError::from_reqwest(self.url.as_str(), e).into()),
            }
        }
        if state.carry.is_empty() {
            return Err(ProxyError::resolution(format!(
                "{} ended early at offset {}",
                self.url, state.offset
            )));
        }
        let take = count.min(state.carry.len());
        Ok(state.carry.split_to(take).freeze())
    }

    /// One iteration of the download loop; returns how long to pause before the next.
    async fn download_step(&self) -> Duration {
        if self.is_closed() {
            return IDLE_INTERVAL;
        }
        let mut state = self.downloader.state.lock().await;
        let count = self
            .limits
            .bitrate
            .min(self.content_length.saturating_sub(state.offset));

        let window_cached = count > 0
            && self
                .ranges
                .lock()
                .contains(&DiskRange::new(state.offset, state.offset + count - 1));
        if count == 0 || window_cached {
            if state.response.take().is_some() {
                debug!("Download closed, next window cached: offset={}", state.offset);
            }
            state.carry.clear();
            self.downloader.wake.wake_all();
            return IDLE_INTERVAL;
        }
        if state.response.is_none() {
            return IDLE_INTERVAL;
        }

        state.preload.consume(self.limits.bitrate);
        if state.preload.bytes > self.limits.max_preload {
            return IDLE_INTERVAL;
        }

        let offset = state.offset;
        let bytes = match self.pull(&mut state, count).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Download pull failed, reopening: offset={} err={}", offset, e);
                if let Err(e) = self.replace_download(&mut state, offset).await {
                    warn!("Failed to reopen download: offset={} err={}", offset, e);
                }
                return IDLE_INTERVAL;
            }
        };

        if let Err(e) = self.store(offset, &bytes).await {
            warn!("Failed to write downloaded bytes: offset={} err={}", offset, e);
            return IDLE_INTERVAL;
        }
        state.preload.bytes += bytes.len() as u64;
        state.offset = offset + bytes.len() as u64;
        debug!(
            "Download pulled: offset={} bytes={} preload={}",
            state.offset,
            bytes.len(),
            state.preload.bytes
        );
        drop(state);
        self.downloader.wake.wake_all();
        PULL_INTERVAL
    }

    /// Answers a GET or HEAD for the proxied file, honouring a single `Range`.
    pub fn serve(self: &Arc<Self>, method: &Method, headers: &HeaderMap) -> Result<Response, ProxyError> {
        let requested = match headers.get(header::RANGE) {
            Some(value) => {
                let value = value
                    .to_str()
                    .map_err(|_| ProxyError::bad_request("unreadable Range header"))?;
                Some(parse_range_header(value, self.content_length)?)
            }
            None => None,
        };
        let range = requested.unwrap_or_else(|| DiskRange::new(0, self.content_length - 1));

        let mut builder = Response::builder()
            .header(header::CONTENT_TYPE, self.content_type.as_str())
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONTENT_LENGTH, range.len().to_string());
        builder = match requested {
            Some(range) => builder.status(StatusCode::PARTIAL_CONTENT).header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", range.start, range.end, self.content_length),
            ),
            None => builder.status(StatusCode::OK),
        };

        let body = if method == Method::HEAD {
            Body::empty()
        } else {
            let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
            tokio::spawn(Arc::clone(self).stream_range(range, tx));
            Body::from_stream(ReceiverStream::new(rx))
        };

        builder
            .body(body)
            .map_err(|e| ProxyError::bad_request(format!("failed to build response: {e}")))
    }

    /// Feeds `range` to one client until it is complete or the client goes away.
    async fn stream_range(
        self: Arc<Self>,
        range: DiskRange,
        tx: mpsc::Sender<std::io::Result<Bytes>>,
    ) {
        let mut next = range.start;
        let mut preload = Preload::new();
        debug!("Client range started: start={} end={}", range.start, range.end);

        while next <= range.end {
            if tx.is_closed() {
                debug!("Client disconnected: offset={}", next);
                return;
            }
            if self.is_closed() {
                let _ = tx
                    .send(Err(std::io::Error::other("proxy was replaced")))
                    .await;
                return;
            }

            preload.consume(self.limits.bitrate);
            if preload.bytes > self.limits.max_preload {
                tokio::time::sleep(IDLE_INTERVAL).await;
                continue;
            }

            let want = DiskRange::new(next, (next + self.limits.chunk_size - 1).min(range.end));
            let on_disk = self.ranges.lock().overlap(&want);
            if let (Overlap::Left, Some(disk)) = on_disk {
                let available = DiskRange::new(next, disk.end.min(want.end));
                let bytes = match self.read(available).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Failed to read cached range: start={} err={}", available.start, e);
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                let sent = bytes.len() as u64;
                if tx.send(Ok(bytes)).await.is_err() {
                    debug!("Client disconnected: offset={}", next);
                    return;
                }
                metrics::record_bytes_served("generic", sent);
                preload.bytes += sent;
                next = available.end + 1;
                continue;
            }

            let listener = self.downloader.wake.listener();
            tokio::pin!(listener);
            listener.as_mut().enable();

            let mut state = self.downloader.state.lock().await;
            let riding = state.response.is_some()
                && state.offset <= next
                && next < state.offset + self.limits.forward_window;
            if !riding {
                let from = self.prefetch_start(next);
                info!(
                    "Replacing download: requested={} from={} previous_offset={}",
                    next, from, state.offset
                );
                if let Err(e) = self.replace_download(&mut state, from).await {
                    warn!("Failed to open download: from={} err={}", from, e);
                    drop(state);
                    let _ = tx
                        .send(Err(std::io::Error::other(e.to_string())))
                        .await;
                    return;
                }
            }
            drop(state);

            let _ = tokio::time::timeout(CLIENT_WAIT, listener).await;
        }
        debug!("Client range finished: start={} end={}", range.start, range.end);
    }
}

impl Drop for FileProxy {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

async fn download_loop(proxy: Weak<FileProxy>, mut stop: watch::Receiver<bool>) {
    loop {
        if *stop.borrow() {
            break;
        }
        let Some(strong) = proxy.upgrade() else {
            break;
        };
        let pause = strong.download_step().await;
        drop(strong);

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = stop.changed() => break,
        }
    }
    debug!("Download loop stopped");
}
