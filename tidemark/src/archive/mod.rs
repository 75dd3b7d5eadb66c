//! Cloud-optimized tile archive access.
//!
//! Wraps the PMTiles reader over two backends: a memory-mapped local file
//! for committed sector archives, and an HTTP range source for the online
//! tier. Remote readers keep their header and directory cached for the life
//! of the reader, so only tile payloads cost a round trip.

mod pool;

pub use pool::ArchivePool;

use std::path::Path;

use bytes::Bytes;
use pmtiles::async_reader::AsyncPmTilesReader;
use pmtiles::cache::HashMapCache;
use pmtiles::{HttpBackend, MmapBackend};
use thiserror::Error;

use crate::coord::TileCoord;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Format(#[from] pmtiles::PmtError),

    #[error("HTTP client error: {0}")]
    Client(String),
}

enum Backend {
    Local(AsyncPmTilesReader<MmapBackend>),
    Remote(AsyncPmTilesReader<HttpBackend, HashMapCache>),
}

/// Random-access reader for one tile archive.
///
/// A valid archive with no tile at the requested coordinate yields
/// `Ok(None)`, never an error.
pub struct TileArchive {
    backend: Backend,
    min_zoom: u8,
    max_zoom: u8,
}

impl TileArchive {
    /// Opens a local archive file.
    pub async fn open_local(path: &Path) -> Result<Self, ArchiveError> {
        let backend = MmapBackend::try_from(path).await?;
        let reader = AsyncPmTilesReader::try_from_source(backend).await?;
        let header = reader.get_header();
        let (min_zoom, max_zoom) = (header.min_zoom, header.max_zoom);
        Ok(Self {
            backend: Backend::Local(reader),
            min_zoom,
            max_zoom,
        })
    }

    /// Opens a remote archive over HTTP range requests.
    ///
    /// The header and directory tree are fetched once and cached inside the
    /// reader; callers are expected to reuse the instance per source.
    pub async fn open_remote(url: &str) -> Result<Self, ArchiveError> {
        let client = pmtiles::reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| ArchiveError::Client(e.to_string()))?;
        let reader =
            AsyncPmTilesReader::new_with_cached_url(HashMapCache::default(), client, url).await?;
        let header = reader.get_header();
        let (min_zoom, max_zoom) = (header.min_zoom, header.max_zoom);
        Ok(Self {
            backend: Backend::Remote(reader),
            min_zoom,
            max_zoom,
        })
    }

    /// Fetches one tile, or `None` when the archive has no entry for it.
    pub async fn get(&self, tile: TileCoord) -> Result<Option<Bytes>, ArchiveError> {
        let bytes = match &self.backend {
            Backend::Local(reader) => {
                reader
                    .get_tile(tile.z, tile.x as u64, tile.y as u64)
                    .await?
            }
            Backend::Remote(reader) => {
                reader
                    .get_tile(tile.z, tile.x as u64, tile.y as u64)
                    .await?
            }
        };
        Ok(bytes)
    }

    pub fn min_zoom(&self) -> u8 {
        self.min_zoom
    }

    pub fn max_zoom(&self) -> u8 {
        self.max_zoom
    }
}
