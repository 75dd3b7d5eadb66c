//! Terrain raster decoding and height-tile algebra.
//!
//! A [`HeightTile`] is a rectangular grid of elevations in metres with `NaN`
//! for unknown samples. Most operations are lazy views over a sampling
//! closure; [`HeightTile::materialize`] forces a view into a concrete array
//! with a pixel margin. The composition pipeline that stitches a 3×3 DEM
//! neighborhood lives in [`compose`].

mod compose;

pub use compose::{load_dem, TileFetcher, OVERZOOM};

use std::sync::Arc;

use thiserror::Error;

use crate::source::Encoding;

#[derive(Debug, Error)]
pub enum TerrainError {
    #[error("raster decode failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("source has no elevation encoding")]
    NotTerrain,
}

type Sampler = Arc<dyn Fn(i32, i32) -> f32 + Send + Sync>;

/// Elevation grid with lazy sampling.
///
/// `width`/`height` describe the logical tile; the sampler may accept
/// coordinates outside that range (neighbor views, materialized margins).
#[derive(Clone)]
pub struct HeightTile {
    pub width: u32,
    pub height: u32,
    sampler: Sampler,
}

impl HeightTile {
    /// Wraps a row-major raster. Out-of-range samples are `NaN`.
    pub fn from_raster(width: u32, height: u32, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        let data = Arc::new(data);
        let (w, h) = (width as i32, height as i32);
        Self {
            width,
            height,
            sampler: Arc::new(move |x, y| {
                if x < 0 || y < 0 || x >= w || y >= h {
                    f32::NAN
                } else {
                    data[(y * w + x) as usize]
                }
            }),
        }
    }

    /// An all-zero tile, used for off-sphere neighbors.
    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            sampler: Arc::new(|_, _| 0.0),
        }
    }

    /// Scalar sample.
    pub fn get(&self, x: i32, y: i32) -> f32 {
        (self.sampler)(x, y)
    }

    /// Builds a virtual 3×3 view with the center tile at the middle.
    ///
    /// The result keeps the center's dimensions but samples into the
    /// neighbors for out-of-range coordinates. Missing neighbors read as
    /// `NaN`; a missing center yields `None`.
    pub fn combine(neighbors: [Option<HeightTile>; 9]) -> Option<HeightTile> {
        let center = neighbors[4].as_ref()?;
        let (width, height) = (center.width, center.height);
        let (w, h) = (width as i32, height as i32);
        let neighbors = Arc::new(neighbors);
        Some(Self {
            width,
            height,
            sampler: Arc::new(move |x, y| {
                let mut idx = 0;
                let (mut x, mut y) = (x, y);
                if y < 0 {
                    y += h;
                } else if y < h {
                    idx += 3;
                } else {
                    y -= h;
                    idx += 6;
                }
                if x < 0 {
                    x += w;
                } else if x < w {
                    idx += 1;
                } else {
                    x -= w;
                    idx += 2;
                }
                match &neighbors[idx] {
                    Some(tile) => tile.get(x, y),
                    None => f32::NAN,
                }
            }),
        })
    }

    /// Extracts one of `factor²` sub-regions, `(sx, sy)` indexed from the
    /// north-west. Out-of-range sampling reaches into the parent view.
    pub fn split(&self, factor: u32, sx: u32, sy: u32) -> Self {
        let width = self.width / factor;
        let height = self.height / factor;
        let (ox, oy) = ((sx * width) as i32, (sy * height) as i32);
        let parent = self.sampler.clone();
        Self {
            width,
            height,
            sampler: Arc::new(move |x, y| parent(x + ox, y + oy)),
        }
    }

    /// Linear 1→`factor` upsample of pixel centers.
    pub fn subsample_pixel_centers(&self, factor: u32) -> Self {
        let parent = self.sampler.clone();
        let f = factor as f32;
        Self {
            width: self.width * factor,
            height: self.height * factor,
            sampler: Arc::new(move |x, y| {
                let half = 1.0 / f / 2.0;
                let xx = x as f32 / f - half;
                let yy = y as f32 / f - half;
                let x0 = xx.floor() as i32;
                let y0 = yy.floor() as i32;
                let fx = xx - x0 as f32;
                let fy = yy - y0 as f32;
                let top = lerp(parent(x0, y0), parent(x0 + 1, y0), fx);
                let bottom = lerp(parent(x0, y0 + 1), parent(x0 + 1, y0 + 1), fx);
                lerp(top, bottom, fy)
            }),
        }
    }

    /// Shifts pixel-centered samples onto grid corners by averaging the
    /// surrounding pixels, growing the grid by one in each axis.
    pub fn average_pixel_centers_to_grid(&self) -> Self {
        let parent = self.sampler.clone();
        Self {
            width: self.width + 1,
            height: self.height + 1,
            sampler: Arc::new(move |x, y| {
                let mut sum = 0.0;
                let mut count = 0u32;
                for ny in y - 1..=y {
                    for nx in x - 1..=x {
                        let v = parent(nx, ny);
                        if !v.is_nan() {
                            sum += v;
                            count += 1;
                        }
                    }
                }
                if count == 0 {
                    f32::NAN
                } else {
                    sum / count as f32
                }
            }),
        }
    }

    /// Forces the view into a concrete array covering
    /// `[-buffer, width + buffer)` in each axis.
    pub fn materialize(&self, buffer: i32) -> Self {
        let stride = self.width as i32 + 2 * buffer;
        let rows = self.height as i32 + 2 * buffer;
        let mut data = Vec::with_capacity((stride * rows) as usize);
        for y in -buffer..self.height as i32 + buffer {
            for x in -buffer..self.width as i32 + buffer {
                data.push(self.get(x, y));
            }
        }
        let data = Arc::new(data);
        Self {
            width: self.width,
            height: self.height,
            sampler: Arc::new(move |x, y| {
                let (x, y) = (x + buffer, y + buffer);
                if x < 0 || y < 0 || x >= stride || y >= rows {
                    f32::NAN
                } else {
                    data[(y * stride + x) as usize]
                }
            }),
        }
    }
}

impl std::fmt::Debug for HeightTile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeightTile")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

fn lerp(a: f32, b: f32, f: f32) -> f32 {
    if a.is_nan() {
        b
    } else if b.is_nan() {
        a
    } else {
        a + (b - a) * f
    }
}

/// Decodes a terrain-RGB raster tile into elevations.
pub fn decode_rgb(bytes: &[u8], encoding: Encoding) -> Result<HeightTile, TerrainError> {
    if encoding == Encoding::None {
        return Err(TerrainError::NotTerrain);
    }
    let img = image::load_from_memory(bytes)?.to_rgba8();
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity((width * height) as usize);
    for pixel in img.pixels() {
        let [r, g, b, _] = pixel.0;
        let (r, g, b) = (r as f32, g as f32, b as f32);
        let elevation = match encoding {
            Encoding::Terrarium => r * 256.0 + g + b / 256.0 - 32768.0,
            Encoding::Mapbox => -10000.0 + (r * 65536.0 + g * 256.0 + b) * 0.1,
            Encoding::None => unreachable!(),
        };
        data.push(elevation);
    }
    Ok(HeightTile::from_raster(width, height, data))
}
