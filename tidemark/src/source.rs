//! Upstream tile source descriptors.
//!
//! Five sources are configured at startup: the OSM basemap, the nautical
//! overlay, two bathymetry grids and the terrain layer. Descriptors are
//! static data; everything that varies at runtime lives in the resolver.

use serde_json::{json, Value};

/// Wire format of a source's tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileFormat {
    Pbf,
    Png,
    Webp,
}

impl TileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TileFormat::Pbf => "pbf",
            TileFormat::Png => "png",
            TileFormat::Webp => "webp",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            TileFormat::Pbf => "application/x-protobuf",
            TileFormat::Png => "image/png",
            TileFormat::Webp => "image/webp",
        }
    }
}

/// Elevation encoding of a raster source, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// `R * 256 + G + B / 256 - 32768`
    Terrarium,
    /// `-10000 + (R * 65536 + G * 256 + B) * 0.1`
    Mapbox,
    /// Not a terrain source.
    None,
}

/// A single upstream source.
#[derive(Debug, Clone)]
pub struct Source {
    /// Short name used in URLs and cache paths.
    pub name: &'static str,
    /// Remote archive URL for the online tier and sector extraction.
    pub url: &'static str,
    /// Archive filename inside a sector directory.
    pub output: &'static str,
    pub minzoom: u8,
    pub maxzoom: u8,
    pub format: TileFormat,
    pub encoding: Encoding,
    pub attribution: &'static str,
}

impl Source {
    /// True when the source carries elevation data.
    pub fn is_terrain(&self) -> bool {
        self.encoding != Encoding::None
    }

    /// TileJSON 3.0 document for the raw tiles of this source.
    pub fn tilejson(&self, base_url: &str) -> Value {
        json!({
            "tilejson": "3.0.0",
            "name": self.name,
            "tiles": [format!(
                "{base_url}/tiles/{}/{{z}}/{{x}}/{{y}}.{}",
                self.name,
                self.format.extension()
            )],
            "minzoom": self.minzoom,
            "maxzoom": self.maxzoom,
            "format": self.format.extension(),
            "attribution": self.attribution,
        })
    }

    /// TileJSON for a vector product derived from this source.
    pub fn derived_tilejson(&self, base_url: &str, kind: &str, minzoom: u8, maxzoom: u8) -> Value {
        json!({
            "tilejson": "3.0.0",
            "name": format!("{}-{kind}", self.name),
            "tiles": [format!("{base_url}/{kind}/{}/{{z}}/{{x}}/{{y}}.pbf", self.name)],
            "minzoom": minzoom,
            "maxzoom": maxzoom,
            "format": "pbf",
            "attribution": self.attribution,
        })
    }
}

/// The set of configured sources, in serving order.
#[derive(Debug)]
pub struct SourceRegistry {
    sources: Vec<Source>,
}

impl SourceRegistry {
    /// The five production sources.
    pub fn defaults() -> Self {
        Self {
            sources: vec![
                Source {
                    name: "osm",
                    url: "https://tiles.tidemark.dev/planet.pmtiles",
                    output: "osm.pmtiles",
                    minzoom: 0,
                    maxzoom: 14,
                    format: TileFormat::Pbf,
                    encoding: Encoding::None,
                    attribution: "© OpenStreetMap contributors",
                },
                Source {
                    name: "seamap",
                    url: "https://tiles.tidemark.dev/seamap.pmtiles",
                    output: "seamap.pmtiles",
                    minzoom: 0,
                    maxzoom: 14,
                    format: TileFormat::Pbf,
                    encoding: Encoding::None,
                    attribution: "© OpenSeaMap contributors",
                },
                Source {
                    name: "gebco",
                    url: "https://tiles.tidemark.dev/gebco-terrarium.pmtiles",
                    output: "gebco.pmtiles",
                    minzoom: 0,
                    maxzoom: 8,
                    format: TileFormat::Webp,
                    encoding: Encoding::Terrarium,
                    attribution: "GEBCO Compilation Group",
                },
                Source {
                    name: "emodnet",
                    url: "https://tiles.tidemark.dev/emodnet.pmtiles",
                    output: "emodnet.pmtiles",
                    minzoom: 3,
                    maxzoom: 10,
                    format: TileFormat::Png,
                    encoding: Encoding::Mapbox,
                    attribution: "EMODnet Bathymetry Consortium",
                },
                Source {
                    name: "mapterhorn",
                    url: "https://tiles.tidemark.dev/mapterhorn.pmtiles",
                    output: "mapterhorn.pmtiles",
                    minzoom: 0,
                    maxzoom: 12,
                    format: TileFormat::Webp,
                    encoding: Encoding::Terrarium,
                    attribution: "© Mapterhorn",
                },
            ],
        }
    }

    /// Builds a registry from explicit descriptors (tests).
    pub fn new(sources: Vec<Source>) -> Self {
        Self { sources }
    }

    pub fn get(&self, name: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// URL probed by the connectivity monitor.
    pub fn probe_url(&self) -> Option<&'static str> {
        self.sources.first().map(|s| s.url)
    }
}
