mod common;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use common::{get, media_playlist, proxy_state, test_config, ts_segment, Upstream};
use serde_json::{json, Value};
use tower::util::ServiceExt;
use watchproxy::create_app;

async fn post_entry(app: &axum::Router, entry: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/entry")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(entry.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = http_body_util::BodyExt::collect(response.into_body()).await.unwrap().to_bytes();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_entry_api_sets_up_proxies() {
    let upstream = Upstream::start().await;
    upstream.put("/hls/index.m3u8", media_playlist(1, 4.0));
    upstream.put("/hls/seg0.ts", ts_segment("api"));
    let mut file = vec![7u8; 300 * 1024];
    file[..12].copy_from_slice(b"\x00\x00\x00\x20ftypisom");
    upstream.put("/files/movie.mp4", file.clone());

    let dir = tempfile::tempdir().unwrap();
    let app = create_app(proxy_state(test_config(dir.path())));

    let (status, body) = post_entry(
        &app,
        json!({"url": upstream.url("/hls/index.m3u8"), "use_proxy": true}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"url": "/watch/proxy/proxy.m3u8", "proxied": true}));
    assert_eq!(get(&app, "/watch/proxy/vi-0", None).await.body, ts_segment("api"));

    let (status, body) = post_entry(
        &app,
        json!({"url": upstream.url("/files/movie.mp4"), "referer": "https://site.example/watch", "use_proxy": true}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"url": "/watch/proxy/proxy.mp4", "proxied": true}));
    let head = get(&app, "/watch/proxy/proxy.mp4", Some("bytes=0-99")).await;
    assert_eq!(head.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(&head.body[..], &file[..100]);

    // The HLS proxy was replaced.
    assert_eq!(get(&app, "/watch/proxy/vi-0", None).await.status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_trusted_entry_reads_manifest_from_media_dir() {
    let upstream = Upstream::start().await;
    upstream.put("/cdn/seg0.ts", ts_segment("local"));

    let media = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(media.path().join("show")).unwrap();
    std::fs::write(
        media.path().join("show/index.m3u8"),
        format!(
            "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\n{}\n#EXT-X-ENDLIST\n",
            upstream.url("/cdn/seg0.ts")
        ),
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let config = watchproxy::config::ProxyConfig {
        trusted_domain: Some("watch.example.org".to_string()),
        media_dir: media.path().to_path_buf(),
        ..test_config(dir.path())
    };
    let app = create_app(proxy_state(config));

    let (status, body) = post_entry(
        &app,
        json!({"url": "https://watch.example.org/media/show/index.m3u8", "use_proxy": true}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"url": "/watch/proxy/proxy.m3u8", "proxied": true}));

    let manifest = get(&app, "/watch/proxy/proxy.m3u8", None).await.text();
    assert!(manifest.contains("\nvi-0\n"));
    assert_eq!(get(&app, "/watch/proxy/vi-0", None).await.body, ts_segment("local"));
    assert_eq!(upstream.hits("/media/show/index.m3u8"), 0);
}

#[tokio::test]
async fn test_entry_api_passthrough_and_errors() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_app(proxy_state(test_config(dir.path())));

    let (status, body) = post_entry(
        &app,
        json!({"url": "https://cdn.example/movie.mp4", "use_proxy": false}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"url": "https://cdn.example/movie.mp4", "proxied": false}));

    let (status, _) = post_entry(&app, json!({"url": "movie.mp4", "use_proxy": true})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let nothing = get(&app, "/watch/proxy/proxy.m3u8", None).await;
    assert_eq!(nothing.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_fallback_and_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_app(proxy_state(test_config(dir.path())));

    let missing = get(&app, "/nope", None).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.text(), "Not found");

    watchproxy::metrics::record_fetch("playlist");
    let metrics = get(&app, "/metrics", None).await;
    assert_eq!(metrics.status, StatusCode::OK);
    assert!(metrics.text().contains("watchproxy_upstream_fetches_total"));
}
