//! DEM neighborhood composition.
//!
//! Derived tiles need elevation beyond their own edges to stay seamless, so
//! the source raster is the 3×3 neighborhood of the parent tile one zoom up
//! (the overzoom offset). X wraps at the date line; rows past the poles are
//! replaced by all-zero tiles. The composed view is split down to the
//! requested quadrant and resampled onto grid corners for the contour
//! generator.

use std::collections::HashMap;
use std::future::Future;

use bytes::Bytes;
use tracing::debug;

use super::{decode_rgb, HeightTile, TerrainError};
use crate::coord::{wrap_x, TileCoord};
use crate::source::Source;

/// Zoom offset between a derived tile and its DEM source.
pub const OVERZOOM: u8 = 1;

/// Minimum grid width fed into the contour generator.
const MIN_GRID_WIDTH: u32 = 100;

/// Capability to fetch one raw tile. Implemented by the resolver; tests
/// substitute a map of canned tiles.
pub trait TileFetcher: Send + Sync {
    fn fetch(
        &self,
        source: &Source,
        tile: TileCoord,
    ) -> impl Future<Output = Option<Bytes>> + Send;
}

enum Neighbor {
    /// Fetch index into the deduplicated request list.
    Fetch(usize),
    /// North/south of the sphere; reads as zero elevation.
    OffSphere,
}

/// Loads and composes the DEM for a derived tile at `tile`.
///
/// Returns `None` when the center source tile is unavailable; missing edge
/// neighbors degrade to `NaN` samples instead. The returned tile is
/// materialized, corner-aligned and carries a one-pixel margin.
pub async fn load_dem<F: TileFetcher>(
    fetcher: &F,
    source: &Source,
    tile: TileCoord,
) -> Result<Option<HeightTile>, TerrainError> {
    let src_z = tile.z - OVERZOOM;
    let parent_x = tile.x >> OVERZOOM;
    let parent_y = tile.y >> OVERZOOM;
    let axis = 1i64 << src_z;

    // Deduplicate fetches: at low zooms the wrap can alias neighbors onto
    // the same tile, and there is no point loading it twice.
    let mut requests: Vec<TileCoord> = Vec::new();
    let mut request_index: HashMap<TileCoord, usize> = HashMap::new();
    let mut layout: Vec<Neighbor> = Vec::with_capacity(9);

    for dy in -1i64..=1 {
        let ny = parent_y as i64 + dy;
        for dx in -1i64..=1 {
            if ny < 0 || ny >= axis {
                layout.push(Neighbor::OffSphere);
                continue;
            }
            let coord = TileCoord {
                z: src_z,
                x: wrap_x(parent_x as i64 + dx, src_z),
                y: ny as u32,
            };
            let idx = *request_index.entry(coord).or_insert_with(|| {
                requests.push(coord);
                requests.len() - 1
            });
            layout.push(Neighbor::Fetch(idx));
        }
    }

    let responses =
        futures::future::join_all(requests.iter().map(|&coord| fetcher.fetch(source, coord)))
            .await;

    let decoded: Vec<Option<HeightTile>> = responses
        .into_iter()
        .enumerate()
        .map(|(i, bytes)| {
            let bytes = bytes?;
            match decode_rgb(&bytes, source.encoding) {
                Ok(tile) => Some(tile),
                Err(err) => {
                    debug!(source = source.name, tile = %requests[i], error = %err,
                        "undecodable DEM tile skipped");
                    None
                }
            }
        })
        .collect();

    let center = match &layout[4] {
        Neighbor::Fetch(idx) => match &decoded[*idx] {
            Some(tile) => tile.clone(),
            None => return Ok(None),
        },
        Neighbor::OffSphere => return Ok(None),
    };
    let (width, height) = (center.width, center.height);

    let mut neighbors: [Option<HeightTile>; 9] = Default::default();
    for (slot, neighbor) in neighbors.iter_mut().zip(layout.iter()) {
        *slot = match neighbor {
            Neighbor::Fetch(idx) => decoded[*idx].clone(),
            Neighbor::OffSphere => Some(HeightTile::zeros(width, height)),
        };
    }

    let composed = match HeightTile::combine(neighbors) {
        Some(tile) => tile,
        None => return Ok(None),
    };
    let quadrant = composed.split(
        1 << OVERZOOM,
        tile.x & ((1 << OVERZOOM) - 1),
        tile.y & ((1 << OVERZOOM) - 1),
    );

    Ok(Some(resample(quadrant)))
}

/// Upsamples small tiles to a workable density, then aligns pixel centers
/// onto grid corners with a one-pixel margin.
fn resample(mut tile: HeightTile) -> HeightTile {
    if tile.width >= MIN_GRID_WIDTH {
        tile = tile.materialize(2);
    } else {
        while tile.width < MIN_GRID_WIDTH {
            tile = tile.subsample_pixel_centers(2).materialize(2);
        }
    }
    tile.average_pixel_centers_to_grid().materialize(1)
}
