//! Derived vector tiles: contours, bathymetry, soundings, composite.
//!
//! Each endpoint shares the same contract: consult the derived cache,
//! compare its timestamp against the underlying terrain tile, regenerate
//! when the source is newer, and treat empty geometry as absent. The
//! composite endpoint decodes the basemap, overlay and all three derived
//! products for a tile and re-encodes them as one.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::contour;
use crate::coord::TileCoord;
use crate::mvt::{self, FeatureData, Geometry, LayerData, PropValue};
use crate::resolver::TileResolver;
use crate::soundings;
use crate::source::{Source, SourceRegistry};
use crate::store::{TileKind, TileStore};
use crate::terrain::{load_dem, HeightTile, OVERZOOM};

/// Derived products are never rendered past this zoom.
pub const MAX_DERIVED_ZOOM: u8 = 14;

/// Basemap and overlay merged into every composite tile.
const COMPOSITE_BASE: [&str; 2] = ["osm", "seamap"];

#[derive(Debug, Error)]
pub enum DerivedError {
    /// The source exists but has no elevation data to derive from.
    #[error("source {0:?} is not a terrain source")]
    NotTerrain(String),

    #[error("unknown source {0:?}")]
    UnknownSource(String),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Terrain(#[from] crate::terrain::TerrainError),

    #[error(transparent)]
    Mvt(#[from] crate::mvt::MvtError),
}

pub struct DerivedTiles {
    sources: Arc<SourceRegistry>,
    resolver: Arc<TileResolver>,
    store: Arc<TileStore>,
    /// Positive depths, ascending, from configuration.
    depth_levels: Vec<f64>,
}

impl DerivedTiles {
    pub fn new(
        sources: Arc<SourceRegistry>,
        resolver: Arc<TileResolver>,
        store: Arc<TileStore>,
        depth_levels: Vec<f64>,
    ) -> Self {
        Self {
            sources,
            resolver,
            store,
            depth_levels,
        }
    }

    /// Zoom range a derived product of `source` is served at.
    pub fn zoom_range(source: &Source) -> (u8, u8) {
        (source.minzoom + OVERZOOM, MAX_DERIVED_ZOOM)
    }

    pub async fn contours(
        &self,
        source: &str,
        tile: TileCoord,
    ) -> Result<Option<Bytes>, DerivedError> {
        let descriptor = self.terrain_source(source)?;
        self.cached_or_generate(TileKind::Contours, descriptor, tile, |dem| {
            vec![contour_layer(&dem, tile.z)]
        })
        .await
    }

    pub async fn bathymetry(
        &self,
        source: &str,
        tile: TileCoord,
    ) -> Result<Option<Bytes>, DerivedError> {
        let descriptor = self.terrain_source(source)?;
        let levels = self.band_levels();
        self.cached_or_generate(TileKind::Bathymetry, descriptor, tile, move |dem| {
            bathymetry_layers(&dem, &levels)
        })
        .await
    }

    pub async fn soundings(
        &self,
        source: &str,
        tile: TileCoord,
    ) -> Result<Option<Bytes>, DerivedError> {
        let descriptor = self.terrain_source(source)?;
        self.cached_or_generate(TileKind::Soundings, descriptor, tile, move |dem| {
            vec![soundings_layer(&dem, tile)]
        })
        .await
    }

    /// Merges the basemap, nautical overlay and the three derived products
    /// into a single tile.
    pub async fn composite(
        &self,
        source: &str,
        tile: TileCoord,
    ) -> Result<Option<Bytes>, DerivedError> {
        let descriptor = self.terrain_source(source)?;
        if !self.in_range(descriptor, tile.z) {
            return Ok(None);
        }

        let cached = self.store.get(TileKind::Composite, source, tile).await;
        if let Some(entry) = &cached {
            if self.composite_fresh(descriptor, tile, entry.mtime).await {
                if let Ok(bytes) = entry.read().await {
                    return Ok(Some(bytes));
                }
            }
        }

        let mut parts: Vec<Vec<u8>> = Vec::new();
        for base in COMPOSITE_BASE {
            if let Some(resolved) = self.resolver.get_tile(base, tile.z, tile.x, tile.y).await {
                parts.push(resolved.bytes.to_vec());
            }
        }
        for bytes in [
            self.contours(source, tile).await?,
            self.bathymetry(source, tile).await?,
            self.soundings(source, tile).await?,
        ]
        .into_iter()
        .flatten()
        {
            parts.push(bytes.to_vec());
        }

        if parts.is_empty() {
            return Ok(None);
        }
        let merged = mvt::merge(&parts)?;
        if merged.is_empty() {
            return Ok(None);
        }
        self.store
            .put(TileKind::Composite, source, tile, &merged)
            .await?;
        Ok(Some(Bytes::from(merged)))
    }

    fn terrain_source(&self, name: &str) -> Result<&Source, DerivedError> {
        let descriptor = self
            .sources
            .get(name)
            .ok_or_else(|| DerivedError::UnknownSource(name.to_string()))?;
        if !descriptor.is_terrain() {
            return Err(DerivedError::NotTerrain(name.to_string()));
        }
        Ok(descriptor)
    }

    fn in_range(&self, source: &Source, z: u8) -> bool {
        let (min, max) = Self::zoom_range(source);
        z >= min && z <= max
    }

    /// Configured depths as negative elevations, ascending.
    fn band_levels(&self) -> Vec<f32> {
        let mut levels: Vec<f32> = self.depth_levels.iter().map(|d| -*d as f32).collect();
        levels.sort_by(|a, b| a.partial_cmp(b).unwrap());
        levels
    }

    /// The DEM tile a derived tile is generated from.
    fn dem_tile(tile: TileCoord) -> TileCoord {
        TileCoord {
            z: tile.z - OVERZOOM,
            x: tile.x >> OVERZOOM,
            y: tile.y >> OVERZOOM,
        }
    }

    async fn source_timestamp(
        &self,
        source: &Source,
        tile: TileCoord,
    ) -> Option<std::time::SystemTime> {
        let dem = Self::dem_tile(tile);
        self.resolver
            .peek_timestamp(source.name, dem.z, dem.x, dem.y)
            .await
    }

    async fn composite_fresh(
        &self,
        descriptor: &Source,
        tile: TileCoord,
        cached: std::time::SystemTime,
    ) -> bool {
        for base in COMPOSITE_BASE {
            if let Some(ts) = self
                .resolver
                .peek_timestamp(base, tile.z, tile.x, tile.y)
                .await
            {
                if ts > cached {
                    return false;
                }
            }
        }
        match self.source_timestamp(descriptor, tile).await {
            Some(ts) => ts <= cached,
            None => true,
        }
    }

    /// The shared derived-tile contract: serve the cache unless the source
    /// tile is strictly newer, otherwise regenerate and store.
    async fn cached_or_generate<F>(
        &self,
        kind: TileKind,
        descriptor: &Source,
        tile: TileCoord,
        generate: F,
    ) -> Result<Option<Bytes>, DerivedError>
    where
        F: FnOnce(HeightTile) -> Vec<LayerData>,
    {
        if !self.in_range(descriptor, tile.z) {
            return Ok(None);
        }

        let cached = self.store.get(kind, descriptor.name, tile).await;
        let source_ts = self.source_timestamp(descriptor, tile).await;

        if let Some(entry) = &cached {
            let fresh = source_ts.is_none_or(|ts| entry.mtime >= ts);
            if fresh {
                if let Ok(bytes) = entry.read().await {
                    return Ok(Some(bytes));
                }
            }
        }

        let dem = match load_dem(self.resolver.as_ref(), descriptor, tile).await? {
            Some(dem) => dem,
            None => {
                debug!(kind = %kind, source = descriptor.name, tile = %tile,
                    "no terrain data for derived tile");
                return Ok(None);
            }
        };

        let layers = generate(dem);
        if layers.iter().all(LayerData::is_empty) {
            return Ok(None);
        }
        let encoded = mvt::encode(layers);
        self.store
            .put(kind, descriptor.name, tile, &encoded)
            .await?;
        Ok(Some(Bytes::from(encoded)))
    }
}

/// Elevation contour lines for land, one multi-line feature per level.
fn contour_layer(dem: &HeightTile, zoom: u8) -> LayerData {
    let interval = contour::contour_interval(zoom);
    let (mut min, mut max) = (f32::INFINITY, f32::NEG_INFINITY);
    for y in 0..dem.height as i32 {
        for x in 0..dem.width as i32 {
            let v = dem.get(x, y);
            if v.is_finite() {
                min = min.min(v);
                max = max.max(v);
            }
        }
    }

    let mut layer = LayerData::new("contours");
    if min > max {
        return layer;
    }

    let levels: Vec<f32> = ((min / interval as f32).ceil() as i32
        ..=(max / interval as f32).floor() as i32)
        .map(|i| (i * interval) as f32)
        .collect();
    if levels.is_empty() {
        return layer;
    }

    for (level, lines) in contour::isolines(dem, &levels, mvt::EXTENT) {
        let elevation = level as i64;
        let major = elevation % (interval as i64 * 5) == 0;
        layer.features.push(FeatureData {
            geometry: Geometry::Lines(lines),
            properties: vec![
                ("ele".to_string(), PropValue::Int(elevation)),
                ("level".to_string(), PropValue::Int(major as i64)),
            ],
        });
    }
    layer
}

/// Depth areas and their label lines along the deeper boundary.
fn bathymetry_layers(dem: &HeightTile, levels: &[f32]) -> Vec<LayerData> {
    let mut areas = LayerData::new("depth_areas");
    let mut labels = LayerData::new("depth_contours");

    for band in contour::isobands(dem, levels, mvt::EXTENT) {
        let polygons: Vec<Vec<Vec<(i32, i32)>>> = band
            .polygons
            .iter()
            .map(|polygon| {
                let mut rings = vec![polygon.outer.clone()];
                rings.extend(polygon.holes.iter().cloned());
                rings
            })
            .collect();
        areas.features.push(FeatureData {
            geometry: Geometry::Polygons(polygons),
            properties: vec![
                (
                    "mindepth".to_string(),
                    PropValue::Float(f64::from(band.upper.abs())),
                ),
                (
                    "maxdepth".to_string(),
                    PropValue::Float(f64::from(band.lower.abs())),
                ),
            ],
        });
        if !band.label_lines.is_empty() {
            labels.features.push(FeatureData {
                geometry: Geometry::Lines(band.label_lines),
                properties: vec![(
                    "depth".to_string(),
                    PropValue::Float(f64::from(band.lower.abs())),
                )],
            });
        }
    }

    vec![areas, labels]
}

/// Spot depths as individual labeled points.
fn soundings_layer(dem: &HeightTile, tile: TileCoord) -> LayerData {
    let mut layer = LayerData::new("soundings");
    for sounding in soundings::generate(dem, tile.z, tile.x, tile.y, mvt::EXTENT) {
        layer.features.push(FeatureData {
            geometry: Geometry::Points(vec![(sounding.x, sounding.y)]),
            properties: vec![("depth".to_string(), PropValue::Float(sounding.depth))],
        });
    }
    layer
}
