//! Filesystem tile cache.
//!
//! One file per tile under `{root}/{kind}/{source}/{z}/{x}/{y}`. The file
//! mtime is the authoritative timestamp; there is no index and no deletion.
//! Readers that only need the timestamp never pay for the body read.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;

use crate::coord::TileCoord;

/// Cache namespace, one per tile product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileKind {
    Tiles,
    Contours,
    Bathymetry,
    Soundings,
    Composite,
}

impl TileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TileKind::Tiles => "tiles",
            TileKind::Contours => "contours",
            TileKind::Bathymetry => "bathymetry",
            TileKind::Soundings => "soundings",
            TileKind::Composite => "composite",
        }
    }
}

impl fmt::Display for TileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A cache hit: the tile's path and timestamp, body read on demand.
#[derive(Debug, Clone)]
pub struct CachedTile {
    path: PathBuf,
    pub mtime: SystemTime,
}

impl CachedTile {
    /// Reads the tile body.
    pub async fn read(&self) -> Result<Bytes, StoreError> {
        Ok(Bytes::from(tokio::fs::read(&self.path).await?))
    }
}

/// Best-effort per-tile file cache.
///
/// Concurrent writers are rare (the resolver coalesces identical requests),
/// so writes are plain `fs::write`; last write wins.
pub struct TileStore {
    root: PathBuf,
}

impl TileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn tile_path(&self, kind: TileKind, source: &str, tile: TileCoord) -> PathBuf {
        self.root
            .join(kind.as_str())
            .join(source)
            .join(tile.z.to_string())
            .join(tile.x.to_string())
            .join(tile.y.to_string())
    }

    /// Looks up a tile, returning its lazy body and mtime.
    pub async fn get(&self, kind: TileKind, source: &str, tile: TileCoord) -> Option<CachedTile> {
        let path = self.tile_path(kind, source, tile);
        let meta = tokio::fs::metadata(&path).await.ok()?;
        if !meta.is_file() {
            return None;
        }
        let mtime = meta.modified().ok()?;
        Some(CachedTile { path, mtime })
    }

    /// Timestamp-only lookup; `None` when the tile is not cached.
    pub async fn mtime(&self, kind: TileKind, source: &str, tile: TileCoord) -> Option<SystemTime> {
        self.get(kind, source, tile).await.map(|t| t.mtime)
    }

    /// Writes a tile, creating intermediate directories.
    pub async fn put(
        &self,
        kind: TileKind,
        source: &str,
        tile: TileCoord,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        let path = self.tile_path(kind, source, tile);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
