//! Static style assets: styles, sprites, glyph ranges.
//!
//! All files are prebuilt on disk under the configured style directory.
//! Every request path is resolved and checked against that root; anything
//! that escapes it after symlink resolution is refused.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use super::ApiError;
use crate::service::TidemarkCore;

pub(super) async fn style(
    State(core): State<Arc<TidemarkCore>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    if name.strip_suffix(".json").is_none() {
        return Err(ApiError::BadRequest("style names end in .json".into()));
    }
    let path = core.config.style_path.join("styles").join(&name);
    serve_file(&core.config.style_path, path, "application/json", 3_600).await
}

pub(super) async fn sprite(
    State(core): State<Arc<TidemarkCore>>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let content_type = match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("json") => "application/json",
        Some("png") => "image/png",
        _ => return Err(ApiError::BadRequest("unsupported sprite format".into())),
    };
    let full = core.config.style_path.join("sprites").join(&path);
    serve_file(&core.config.style_path, full, content_type, 86_400).await
}

pub(super) async fn glyphs(
    State(core): State<Arc<TidemarkCore>>,
    Path((fontstack, range)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    if range.strip_suffix(".pbf").is_none() {
        return Err(ApiError::BadRequest("glyph ranges end in .pbf".into()));
    }
    let path = core
        .config
        .style_path
        .join("glyphs")
        .join(&fontstack)
        .join(&range);
    serve_file(&core.config.style_path, path, "application/x-protobuf", 86_400).await
}

/// Reads a file after confirming it resolves inside `root`.
async fn serve_file(
    root: &FsPath,
    path: PathBuf,
    content_type: &str,
    max_age: u32,
) -> Result<Response, ApiError> {
    let root = tokio::fs::canonicalize(root)
        .await
        .map_err(|_| ApiError::NotFound)?;
    let resolved = tokio::fs::canonicalize(&path)
        .await
        .map_err(|_| ApiError::NotFound)?;
    if !resolved.starts_with(&root) {
        warn!(path = %path.display(), "rejected static path outside style root");
        return Err(ApiError::Forbidden);
    }

    let bytes = tokio::fs::read(&resolved)
        .await
        .map_err(|_| ApiError::NotFound)?;
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CACHE_CONTROL, format!("public, max-age={max_age}")),
        ],
        bytes,
    )
        .into_response())
}
