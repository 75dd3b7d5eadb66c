//! Tile coordinate module
//!
//! XYZ tile addressing in Web Mercator (EPSG:3857), reduction of tiles to
//! their zoom-6 storage sector, and the inverse projection used to compute
//! geographic bounding boxes for sector extraction.

use std::f64::consts::PI;
use std::fmt;

use thiserror::Error;

/// Zoom level of the offline storage unit. A sector at this zoom covers
/// roughly 350 km at the equator.
pub const SECTOR_ZOOM: u8 = 6;

/// Maximum latitude representable in Web Mercator.
pub const MAX_LAT: f64 = 85.051_128_78;

/// Coordinate errors.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The x or y index does not exist at the given zoom.
    #[error("tile ({x}, {y}) out of range for zoom {z}")]
    OutOfRange { z: u8, x: u32, y: u32 },

    /// A sector identifier string did not parse as `z/x/y`.
    #[error("invalid sector identifier: {0:?}")]
    InvalidSector(String),
}

/// An XYZ tile address. `y = 0` is the northernmost row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

/// Geographic bounds of a tile, degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl TileCoord {
    /// Creates a tile coordinate, validating the index range for the zoom.
    pub fn new(z: u8, x: u32, y: u32) -> Result<Self, CoordError> {
        let max = 1u64 << z;
        if (x as u64) < max && (y as u64) < max {
            Ok(Self { z, x, y })
        } else {
            Err(CoordError::OutOfRange { z, x, y })
        }
    }

    /// Number of tiles along one axis at this tile's zoom.
    pub fn axis_tiles(&self) -> u32 {
        1u32 << self.z.min(31)
    }

    /// Reduces this tile to the zoom-6 sector containing it.
    ///
    /// Returns `None` for `z < 6`: such a tile spans several sectors, so the
    /// offline tier cannot serve it.
    pub fn sector(&self) -> Option<Sector> {
        if self.z < SECTOR_ZOOM {
            return None;
        }
        let shift = self.z - SECTOR_ZOOM;
        Some(Sector {
            x: self.x >> shift,
            y: self.y >> shift,
        })
    }

    /// Geographic bounds via the Web Mercator inverse.
    pub fn bbox(&self) -> Bbox {
        let n = 2f64.powi(self.z as i32);
        let lat = |row: f64| (PI * (1.0 - 2.0 * row / n)).sinh().atan().to_degrees();
        Bbox {
            west: self.x as f64 / n * 360.0 - 180.0,
            east: (self.x + 1) as f64 / n * 360.0 - 180.0,
            north: lat(self.y as f64),
            south: lat((self.y + 1) as f64),
        }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// A zoom-6 sector, the unit of offline archive storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sector {
    pub x: u32,
    pub y: u32,
}

impl Sector {
    /// Parses a sector identifier of the form `z/x/y`.
    ///
    /// The zoom may be any value `>= 6`; the tile is reduced to its sector.
    /// Anything that is not three non-negative integers is rejected.
    pub fn parse(id: &str) -> Result<Self, CoordError> {
        let mut parts = id.split('/');
        let (z, x, y) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(z), Some(x), Some(y), None) => (z, x, y),
            _ => return Err(CoordError::InvalidSector(id.to_string())),
        };
        let z: u8 = z
            .parse()
            .map_err(|_| CoordError::InvalidSector(id.to_string()))?;
        let x: u32 = x
            .parse()
            .map_err(|_| CoordError::InvalidSector(id.to_string()))?;
        let y: u32 = y
            .parse()
            .map_err(|_| CoordError::InvalidSector(id.to_string()))?;
        let tile = TileCoord::new(z, x, y).map_err(|_| CoordError::InvalidSector(id.to_string()))?;
        tile.sector()
            .ok_or_else(|| CoordError::InvalidSector(id.to_string()))
    }

    /// The tile coordinate of this sector at the sector zoom.
    pub fn tile(&self) -> TileCoord {
        TileCoord {
            z: SECTOR_ZOOM,
            x: self.x,
            y: self.y,
        }
    }

    /// Directory name used on disk, e.g. `6_34_22`.
    pub fn dirname(&self) -> String {
        format!("{}_{}_{}", SECTOR_ZOOM, self.x, self.y)
    }

    /// Public identifier, e.g. `6/34/22`.
    pub fn id(&self) -> String {
        self.tile().to_string()
    }
}

/// Wraps a neighbor x index at the date line.
pub fn wrap_x(x: i64, z: u8) -> u32 {
    let max = 1i64 << z;
    (((x % max) + max) % max) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_reduction_matches_direct_computation() {
        for (z, x, y) in [(6u8, 34u32, 22u32), (8, 132, 88), (14, 8899, 5528)] {
            let tile = TileCoord::new(z, x, y).unwrap();
            let sector = tile.sector().unwrap();
            assert_eq!(sector.x, x / (1 << (z - 6)));
            assert_eq!(sector.y, y / (1 << (z - 6)));
        }
    }

    #[test]
    fn sector_reduction_is_stable() {
        let tile = TileCoord::new(11, 1068, 660).unwrap();
        let sector = tile.sector().unwrap();
        // Reducing the sector tile again is the identity.
        assert_eq!(sector.tile().sector().unwrap(), sector);
    }

    #[test]
    fn low_zoom_has_no_sector() {
        assert!(TileCoord::new(5, 0, 0).unwrap().sector().is_none());
        assert!(TileCoord::new(0, 0, 0).unwrap().sector().is_none());
    }

    #[test]
    fn bbox_is_ordered_and_bounded() {
        for (z, x, y) in [(0u8, 0u32, 0u32), (6, 34, 22), (10, 523, 340), (14, 0, 16383)] {
            let b = TileCoord::new(z, x, y).unwrap().bbox();
            assert!(b.west < b.east, "{z}/{x}/{y}");
            assert!(b.south < b.north, "{z}/{x}/{y}");
            assert!(b.west >= -180.0 && b.east <= 180.0);
            assert!(b.south > -MAX_LAT - 1e-6 && b.north < MAX_LAT + 1e-6);
        }
    }

    #[test]
    fn bbox_of_world_tile() {
        let b = TileCoord::new(0, 0, 0).unwrap().bbox();
        assert_eq!(b.west, -180.0);
        assert_eq!(b.east, 180.0);
        assert!((b.north - MAX_LAT).abs() < 1e-6);
        assert!((b.south + MAX_LAT).abs() < 1e-6);
    }

    #[test]
    fn parse_accepts_canonical_identifiers() {
        let s = Sector::parse("6/34/22").unwrap();
        assert_eq!((s.x, s.y), (34, 22));
        assert_eq!(s.dirname(), "6_34_22");
        assert_eq!(s.id(), "6/34/22");
    }

    #[test]
    fn parse_reduces_deeper_zooms() {
        let s = Sector::parse("8/132/88").unwrap();
        assert_eq!((s.x, s.y), (33, 22));
    }

    #[test]
    fn parse_rejects_malformed_identifiers() {
        for bad in ["", "6/34", "6/34/22/1", "6/-1/2", "a/b/c", "../../etc", "6/34/99999"] {
            assert!(Sector::parse(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn wrap_x_wraps_at_date_line() {
        assert_eq!(wrap_x(-1, 6), 63);
        assert_eq!(wrap_x(64, 6), 0);
        assert_eq!(wrap_x(10, 6), 10);
    }
}
