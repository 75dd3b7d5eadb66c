//! HTTP status mapping for the route table.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use tempfile::TempDir;
use tower::util::ServiceExt;

use tidemark::config::TidemarkConfig;
use tidemark::server;
use tidemark::service::TidemarkCore;

struct Api {
    router: axum::Router,
    _dir: TempDir,
    style_root: std::path::PathBuf,
}

fn api() -> Api {
    let dir = TempDir::new().unwrap();
    let config = TidemarkConfig::with_data_dir(dir.path());
    let style_root = config.style_path.clone();
    let core = Arc::new(TidemarkCore::new(config));
    Api {
        router: server::router(core),
        _dir: dir,
        style_root,
    }
}

async fn get(api: &Api, uri: &str) -> (StatusCode, axum::http::HeaderMap) {
    let response = api
        .router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    (response.status(), response.headers().clone())
}

#[tokio::test]
async fn health_is_ok() {
    let api = api();
    let (status, headers) = get(&api, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
}

#[tokio::test]
async fn tilejson_for_known_source() {
    let api = api();
    let (status, headers) = get(&api, "/tiles/osm.json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=3600");
}

#[tokio::test]
async fn tilejson_for_unknown_source_is_404() {
    let api = api();
    let (status, _) = get(&api, "/tiles/bing.json").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get(&api, "/tiles/osm").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_tile_is_204() {
    let api = api();
    let (status, _) = get(&api, "/tiles/osm/8/132/88.pbf").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn out_of_range_zoom_is_204() {
    let api = api();
    let (status, _) = get(&api, "/tiles/osm/15/0/0.pbf").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn malformed_coordinates_are_400() {
    let api = api();
    for uri in [
        "/tiles/osm/abc/0/0.pbf",
        "/tiles/osm/8/-1/0.pbf",
        "/tiles/osm/8/0/0",
        "/tiles/osm/3/99/0.pbf",
        "/tiles/osm/8/132/88.webp",
    ] {
        let (status, _) = get(&api, uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn unknown_tile_source_is_404() {
    let api = api();
    let (status, _) = get(&api, "/tiles/bing/8/132/88.pbf").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn derived_tilejson_requires_terrain_source() {
    let api = api();
    let (status, _) = get(&api, "/bathymetry/gebco.json").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = get(&api, "/bathymetry/osm.json").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get(&api, "/contours/mapterhorn.json").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn derived_tile_without_terrain_data_is_204() {
    let api = api();
    let (status, _) = get(&api, "/contours/mapterhorn/10/500/300.pbf").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn download_status_is_always_available() {
    let api = api();
    let (status, headers) = get(&api, "/pmtiles/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
}

#[tokio::test]
async fn delete_with_traversal_identifier_is_400() {
    let api = api();
    let response = api
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/pmtiles?tile=../../etc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_resets_and_returns_status() {
    let api = api();
    let response = api
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/pmtiles/cancel")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn style_is_served_with_cache_headers() {
    let api = api();
    let styles = api.style_root.join("styles");
    std::fs::create_dir_all(&styles).unwrap();
    std::fs::write(styles.join("marine.json"), b"{}").unwrap();

    let (status, headers) = get(&api, "/styles/marine.json").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CACHE_CONTROL], "public, max-age=3600");

    let (status, _) = get(&api, "/styles/missing.json").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get(&api, "/styles/marine.yaml").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn symlinked_style_outside_root_is_403() {
    let api = api();
    let outside = TempDir::new().unwrap();
    std::fs::write(outside.path().join("secret.json"), b"{}").unwrap();
    let styles = api.style_root.join("styles");
    std::fs::create_dir_all(&styles).unwrap();
    std::os::unix::fs::symlink(
        outside.path().join("secret.json"),
        styles.join("evil.json"),
    )
    .unwrap();

    let (status, _) = get(&api, "/styles/evil.json").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn glyph_range_must_be_pbf() {
    let api = api();
    let (status, _) = get(&api, "/glyphs/Noto%20Sans/0-255.txt").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
