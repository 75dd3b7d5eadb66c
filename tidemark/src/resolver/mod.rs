//! Tile resolution engine.
//!
//! Answers every raw tile request through a three-tier fallback: the
//! filesystem cache, the offline sector archives, and finally an online
//! range-fetch against the source's remote archive. Identical concurrent
//! requests are coalesced so at most one fetch per key is ever in flight.
//! Tier failures are absorbed: a broken tier falls through to the next, and
//! only when every tier comes up empty does the request resolve to absent.

mod coalesce;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::archive::{ArchivePool, TileArchive};
use crate::connectivity::ConnectivityMonitor;
use crate::coord::TileCoord;
use crate::source::{Source, SourceRegistry};
use crate::store::{TileKind, TileStore};
use crate::terrain::TileFetcher;

use coalesce::{Coalescer, Registration, TileKey};

/// A resolved tile: its bytes and the timestamp of the tier that served it.
#[derive(Debug, Clone)]
pub struct ResolvedTile {
    pub bytes: Bytes,
    pub mtime: SystemTime,
}

pub struct TileResolver {
    sources: Arc<SourceRegistry>,
    store: Arc<TileStore>,
    pool: Arc<ArchivePool>,
    connectivity: Arc<ConnectivityMonitor>,
    archive_root: PathBuf,
    freshness_window: Duration,
    /// Cleared when the extraction utility is missing at startup; without it
    /// no sector can ever have been published, so the offline tier is moot.
    offline_enabled: bool,
    coalescer: Coalescer,
    /// Per-source online readers; keeps the remote archive directory warm.
    remote: DashMap<String, Arc<TileArchive>>,
}

impl TileResolver {
    pub fn new(
        sources: Arc<SourceRegistry>,
        store: Arc<TileStore>,
        pool: Arc<ArchivePool>,
        connectivity: Arc<ConnectivityMonitor>,
        archive_root: PathBuf,
        freshness_window: Duration,
        offline_enabled: bool,
    ) -> Self {
        Self {
            sources,
            store,
            pool,
            connectivity,
            archive_root,
            freshness_window,
            offline_enabled,
            coalescer: Coalescer::new(),
            remote: DashMap::new(),
        }
    }

    /// Resolves one tile, coalescing with any identical in-flight request.
    pub async fn get_tile(&self, source: &str, z: u8, x: u32, y: u32) -> Option<ResolvedTile> {
        let key = TileKey {
            source: source.to_string(),
            z,
            x,
            y,
        };
        match self.coalescer.register(key.clone()) {
            Registration::Follower(mut rx) => match rx.recv().await {
                Ok(outcome) => outcome,
                // Lead dropped without publishing; treat as absent.
                Err(_) => None,
            },
            Registration::Lead => {
                let outcome = self.resolve(source, z, x, y).await;
                self.coalescer.complete(&key, outcome.clone());
                outcome
            }
        }
    }

    /// Timestamp of the freshest local copy of a tile, without reading the
    /// body. `None` when neither the cache nor an offline archive has it.
    pub async fn peek_timestamp(&self, source: &str, z: u8, x: u32, y: u32) -> Option<SystemTime> {
        let descriptor = self.sources.get(source)?;
        if z < descriptor.minzoom || z > descriptor.maxzoom {
            return None;
        }
        let tile = TileCoord::new(z, x, y).ok()?;
        let cache = self.store.mtime(TileKind::Tiles, source, tile).await;
        let offline = self.offline_mtime(descriptor, tile).await;
        match (cache, offline) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    async fn resolve(&self, source: &str, z: u8, x: u32, y: u32) -> Option<ResolvedTile> {
        let descriptor = self.sources.get(source)?;
        if z < descriptor.minzoom || z > descriptor.maxzoom {
            return None;
        }
        let tile = TileCoord::new(z, x, y).ok()?;

        let cache = self.store.get(TileKind::Tiles, source, tile).await;
        let cache_mtime = cache.as_ref().map(|c| c.mtime);
        let offline_mtime = self.offline_mtime(descriptor, tile).await;

        // Fresh-offline rule: a copy younger than the window is served
        // without going online, preferring the newer tier. On equal
        // timestamps the cache wins; its bytes are already extracted.
        let newest = match (cache_mtime, offline_mtime) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let fresh = newest
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age < self.freshness_window);

        if fresh {
            let offline_newer = match (offline_mtime, cache_mtime) {
                (Some(o), Some(c)) => o > c,
                (Some(_), None) => true,
                _ => false,
            };
            if offline_newer {
                if let Some(resolved) = self.from_offline(descriptor, tile, offline_mtime?).await {
                    return Some(resolved);
                }
            }
            if let Some(entry) = &cache {
                match entry.read().await {
                    Ok(bytes) => {
                        return Some(ResolvedTile {
                            bytes,
                            mtime: entry.mtime,
                        })
                    }
                    Err(err) => {
                        debug!(source, tile = %tile, error = %err, "cache read failed");
                    }
                }
            }
            // An archive without this tile, or an unreadable cache file,
            // falls through to the online tier.
        }

        if self.connectivity.is_online() && !descriptor.url.is_empty() {
            if let Some(bytes) = self.from_online(descriptor, tile).await {
                if let Err(err) = self.store.put(TileKind::Tiles, source, tile, &bytes).await {
                    warn!(source, tile = %tile, error = %err, "tile cache write failed");
                }
                return Some(ResolvedTile {
                    bytes,
                    mtime: SystemTime::now(),
                });
            }
        }

        // Stale local copies still beat an empty response when offline.
        if let Some(resolved) = self.from_offline_or_cache(descriptor, tile, cache).await {
            return Some(resolved);
        }

        None
    }

    fn offline_path(&self, descriptor: &Source, tile: TileCoord) -> Option<PathBuf> {
        if !self.offline_enabled {
            return None;
        }
        let sector = tile.sector()?;
        Some(
            self.archive_root
                .join(sector.dirname())
                .join(descriptor.output),
        )
    }

    async fn offline_mtime(&self, descriptor: &Source, tile: TileCoord) -> Option<SystemTime> {
        let path = self.offline_path(descriptor, tile)?;
        let meta = tokio::fs::metadata(&path).await.ok()?;
        meta.modified().ok()
    }

    async fn from_offline(
        &self,
        descriptor: &Source,
        tile: TileCoord,
        mtime: SystemTime,
    ) -> Option<ResolvedTile> {
        let path = self.offline_path(descriptor, tile)?;
        let archive = match self.pool.acquire(&path).await {
            Ok(archive) => archive,
            Err(err) => {
                debug!(source = descriptor.name, path = %path.display(), error = %err,
                    "offline archive open failed");
                return None;
            }
        };
        match archive.get(tile).await {
            Ok(Some(bytes)) => Some(ResolvedTile { bytes, mtime }),
            Ok(None) => None,
            Err(err) => {
                debug!(source = descriptor.name, tile = %tile, error = %err,
                    "offline archive read failed");
                None
            }
        }
    }

    async fn from_offline_or_cache(
        &self,
        descriptor: &Source,
        tile: TileCoord,
        cache: Option<crate::store::CachedTile>,
    ) -> Option<ResolvedTile> {
        let offline_mtime = self.offline_mtime(descriptor, tile).await;
        let cache_mtime = cache.as_ref().map(|c| c.mtime);
        if offline_mtime > cache_mtime {
            if let Some(resolved) = self
                .from_offline(descriptor, tile, offline_mtime.unwrap())
                .await
            {
                return Some(resolved);
            }
        }
        let entry = cache?;
        let bytes = entry.read().await.ok()?;
        Some(ResolvedTile {
            bytes,
            mtime: entry.mtime,
        })
    }

    async fn from_online(&self, descriptor: &Source, tile: TileCoord) -> Option<Bytes> {
        let archive = match self.remote.get(descriptor.name) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                let archive = match TileArchive::open_remote(descriptor.url).await {
                    Ok(archive) => Arc::new(archive),
                    Err(err) => {
                        debug!(source = descriptor.name, error = %err,
                            "remote archive open failed");
                        return None;
                    }
                };
                self.remote
                    .insert(descriptor.name.to_string(), Arc::clone(&archive));
                archive
            }
        };
        match archive.get(tile).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(source = descriptor.name, tile = %tile, error = %err,
                    "online fetch failed");
                None
            }
        }
    }
}

impl TileFetcher for TileResolver {
    async fn fetch(&self, source: &Source, tile: TileCoord) -> Option<Bytes> {
        self.get_tile(source.name, tile.z, tile.x, tile.y)
            .await
            .map(|resolved| resolved.bytes)
    }
}
