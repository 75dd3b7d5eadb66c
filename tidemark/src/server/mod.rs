//! HTTP router.
//!
//! Thin glue over the core: every handler validates, delegates and maps the
//! outcome onto a status code. Empty is a first-class outcome (204), not an
//! error; transient tier failures never surface here because the resolver
//! absorbs them.

mod statics;

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::coord::TileCoord;
use crate::derived::{DerivedError, DerivedTiles};
use crate::download::{utility_available, DownloadError};
use crate::mvt;
use crate::service::TidemarkCore;
use crate::store::TileKind;

/// Cache lifetime for tile and asset payloads.
const TILE_MAX_AGE: u32 = 86_400;
/// Cache lifetime for TileJSON and style documents.
const DOC_MAX_AGE: u32 = 3_600;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound,
    Forbidden,
    Unavailable,
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound => StatusCode::NOT_FOUND.into_response(),
            ApiError::Forbidden => StatusCode::FORBIDDEN.into_response(),
            ApiError::Unavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "extraction utility not found").into_response()
            }
            ApiError::Internal(msg) => {
                error!(error = msg, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

impl From<DerivedError> for ApiError {
    fn from(err: DerivedError) -> Self {
        match err {
            DerivedError::UnknownSource(_) | DerivedError::NotTerrain(_) => ApiError::NotFound,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::Validation(msg) => ApiError::BadRequest(msg),
            DownloadError::Forbidden => ApiError::Forbidden,
            DownloadError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}

/// Builds the full route table.
pub fn router(core: Arc<TidemarkCore>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tiles/{source}", get(source_tilejson))
        .route("/tiles/{source}/{z}/{x}/{y_ext}", get(source_tile))
        .route("/contours/{source}", get(contours_tilejson))
        .route("/contours/{source}/{z}/{x}/{y_ext}", get(contours_tile))
        .route("/bathymetry/{source}", get(bathymetry_tilejson))
        .route("/bathymetry/{source}/{z}/{x}/{y_ext}", get(bathymetry_tile))
        .route("/soundings/{source}", get(soundings_tilejson))
        .route("/soundings/{source}/{z}/{x}/{y_ext}", get(soundings_tile))
        .route("/composite/{source}", get(composite_tilejson))
        .route("/composite/{source}/{z}/{x}/{y_ext}", get(composite_tile))
        .route(
            "/pmtiles",
            get(list_sectors).post(enqueue_download).delete(delete_sector),
        )
        .route("/pmtiles/status", get(download_status))
        .route("/pmtiles/cancel", axum::routing::post(cancel_download))
        .route("/styles/{name}", get(statics::style))
        .route("/sprites/{*path}", get(statics::sprite))
        .route("/glyphs/{fontstack}/{range}", get(statics::glyphs))
        .layer(CorsLayer::new().allow_methods(Any).allow_origin(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(core)
}

fn json_response(value: serde_json::Value, max_age: u32) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::CACHE_CONTROL,
                format!("public, max-age={max_age}"),
            ),
        ],
        value.to_string(),
    )
        .into_response()
}

/// Tile payload response; 204 when the body is absent.
fn tile_response(bytes: Option<bytes::Bytes>, content_type: &str) -> Response {
    let Some(bytes) = bytes else {
        return StatusCode::NO_CONTENT.into_response();
    };
    // Archives commonly store vector tiles gzip-compressed; pass the
    // encoding through instead of inflating on every request.
    let gzipped = mvt::is_gzip(&bytes);
    let mut response = (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CACHE_CONTROL,
                format!("public, max-age={TILE_MAX_AGE}"),
            ),
        ],
        bytes,
    )
        .into_response();
    if gzipped {
        response.headers_mut().insert(
            header::CONTENT_ENCODING,
            axum::http::HeaderValue::from_static("gzip"),
        );
    }
    response
}

/// Parses `{z}/{x}/{y}.{ext}` path segments; any malformed piece is a 400.
fn parse_tile_path(
    z: &str,
    x: &str,
    y_ext: &str,
) -> Result<(TileCoord, String), ApiError> {
    let (y, ext) = y_ext
        .split_once('.')
        .ok_or_else(|| ApiError::BadRequest("missing tile extension".into()))?;
    let z: u8 = z
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("bad zoom {z:?}")))?;
    let x: u32 = x
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("bad column {x:?}")))?;
    let y: u32 = y
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("bad row {y:?}")))?;
    let tile = TileCoord::new(z, x, y)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok((tile, ext.to_string()))
}

async fn health(State(core): State<Arc<TidemarkCore>>) -> Response {
    let sources: Vec<_> = core.sources.iter().map(|s| s.name).collect();
    json_response(
        json!({
            "status": "ok",
            "online": core.connectivity.is_online(),
            "sources": sources,
        }),
        0,
    )
}

async fn source_tilejson(
    State(core): State<Arc<TidemarkCore>>,
    Path(source): Path<String>,
) -> Result<Response, ApiError> {
    let name = source.strip_suffix(".json").ok_or(ApiError::NotFound)?;
    let descriptor = core.sources.get(name).ok_or(ApiError::NotFound)?;
    Ok(json_response(
        descriptor.tilejson(&core.config.base_url),
        DOC_MAX_AGE,
    ))
}

async fn source_tile(
    State(core): State<Arc<TidemarkCore>>,
    Path((source, z, x, y_ext)): Path<(String, String, String, String)>,
) -> Result<Response, ApiError> {
    let (tile, ext) = parse_tile_path(&z, &x, &y_ext)?;
    let descriptor = core.sources.get(&source).ok_or(ApiError::NotFound)?;
    if ext != descriptor.format.extension() {
        return Err(ApiError::BadRequest(format!(
            "source {source} serves .{}",
            descriptor.format.extension()
        )));
    }
    let resolved = core.resolver.get_tile(&source, tile.z, tile.x, tile.y).await;
    Ok(tile_response(
        resolved.map(|r| r.bytes),
        descriptor.format.content_type(),
    ))
}

async fn derived_tilejson(
    core: &TidemarkCore,
    kind: TileKind,
    source: &str,
) -> Result<Response, ApiError> {
    let name = source.strip_suffix(".json").ok_or(ApiError::NotFound)?;
    let descriptor = core.sources.get(name).ok_or(ApiError::NotFound)?;
    if !descriptor.is_terrain() {
        return Err(ApiError::NotFound);
    }
    let (minzoom, maxzoom) = DerivedTiles::zoom_range(descriptor);
    Ok(json_response(
        descriptor.derived_tilejson(&core.config.base_url, kind.as_str(), minzoom, maxzoom),
        DOC_MAX_AGE,
    ))
}

async fn derived_tile(
    core: &TidemarkCore,
    kind: TileKind,
    source: &str,
    z: &str,
    x: &str,
    y_ext: &str,
) -> Result<Response, ApiError> {
    let (tile, ext) = parse_tile_path(z, x, y_ext)?;
    if ext != "pbf" {
        return Err(ApiError::BadRequest("derived tiles are .pbf".into()));
    }
    let bytes = match kind {
        TileKind::Contours => core.derived.contours(source, tile).await?,
        TileKind::Bathymetry => core.derived.bathymetry(source, tile).await?,
        TileKind::Soundings => core.derived.soundings(source, tile).await?,
        TileKind::Composite => core.derived.composite(source, tile).await?,
        TileKind::Tiles => return Err(ApiError::NotFound),
    };
    Ok(tile_response(bytes, "application/x-protobuf"))
}

macro_rules! derived_handlers {
    ($json_fn:ident, $tile_fn:ident, $kind:expr) => {
        async fn $json_fn(
            State(core): State<Arc<TidemarkCore>>,
            Path(source): Path<String>,
        ) -> Result<Response, ApiError> {
            derived_tilejson(&core, $kind, &source).await
        }

        async fn $tile_fn(
            State(core): State<Arc<TidemarkCore>>,
            Path((source, z, x, y_ext)): Path<(String, String, String, String)>,
        ) -> Result<Response, ApiError> {
            derived_tile(&core, $kind, &source, &z, &x, &y_ext).await
        }
    };
}

derived_handlers!(contours_tilejson, contours_tile, TileKind::Contours);
derived_handlers!(bathymetry_tilejson, bathymetry_tile, TileKind::Bathymetry);
derived_handlers!(soundings_tilejson, soundings_tile, TileKind::Soundings);
derived_handlers!(composite_tilejson, composite_tile, TileKind::Composite);

#[derive(Debug, Deserialize)]
struct SectorQuery {
    tile: Option<String>,
}

async fn list_sectors(State(core): State<Arc<TidemarkCore>>) -> Result<Response, ApiError> {
    if !utility_available() {
        return Err(ApiError::Unavailable);
    }
    let sectors = core.downloads.list_sectors().await?;
    Ok(json_response(json!({ "sectors": sectors }), 0))
}

async fn enqueue_download(
    State(core): State<Arc<TidemarkCore>>,
    Query(query): Query<SectorQuery>,
) -> Result<Response, ApiError> {
    if !utility_available() {
        return Err(ApiError::Unavailable);
    }
    let tiles = query
        .tile
        .ok_or_else(|| ApiError::BadRequest("missing tile parameter".into()))?;
    core.downloads.enqueue(&tiles)?;
    Ok(json_response(
        serde_json::to_value(core.downloads.status()).unwrap_or_default(),
        0,
    ))
}

async fn delete_sector(
    State(core): State<Arc<TidemarkCore>>,
    Query(query): Query<SectorQuery>,
) -> Result<Response, ApiError> {
    let tile = query
        .tile
        .ok_or_else(|| ApiError::BadRequest("missing tile parameter".into()))?;
    core.downloads.delete_sector(&tile).await?;
    Ok(StatusCode::OK.into_response())
}

async fn download_status(State(core): State<Arc<TidemarkCore>>) -> Response {
    json_response(
        serde_json::to_value(core.downloads.status()).unwrap_or_default(),
        0,
    )
}

async fn cancel_download(State(core): State<Arc<TidemarkCore>>) -> Response {
    core.downloads.cancel();
    json_response(
        serde_json::to_value(core.downloads.status()).unwrap_or_default(),
        0,
    )
}
