//! Vector tile encoding and merging.
//!
//! Builds the compact protobuf tile format from named layers of features.
//! Coordinates are already integers in `0..=extent` space; the encoder owns
//! key/value interning, zigzag delta encoding and ring winding. The decode
//! direction is only used by the composite endpoint, which concatenates the
//! layers of several finished tiles into one.

use std::collections::HashMap;
use std::io::Read;

use geozero::mvt::tile::{Feature, GeomType, Layer, Value};
use geozero::mvt::{Message, Tile};
use thiserror::Error;

/// Tile extent used for every emitted layer.
pub const EXTENT: u32 = 4096;

const CMD_MOVE_TO: u32 = 1;
const CMD_LINE_TO: u32 = 2;
const CMD_CLOSE_PATH: u32 = 7;

#[derive(Debug, Error)]
pub enum MvtError {
    #[error("tile decode failed: {0}")]
    Decode(String),

    #[error("gzip decompression failed: {0}")]
    Gzip(#[from] std::io::Error),
}

/// A feature property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Str(String),
    Float(f64),
    Int(i64),
    Bool(bool),
}

/// Feature geometry in integer tile coordinates.
#[derive(Debug, Clone)]
pub enum Geometry {
    /// One or more points.
    Points(Vec<(i32, i32)>),
    /// One or more polylines.
    Lines(Vec<Vec<(i32, i32)>>),
    /// One or more polygons, each as rings with the outer ring first.
    Polygons(Vec<Vec<Vec<(i32, i32)>>>),
}

#[derive(Debug, Clone)]
pub struct FeatureData {
    pub geometry: Geometry,
    pub properties: Vec<(String, PropValue)>,
}

#[derive(Debug, Clone)]
pub struct LayerData {
    pub name: String,
    pub features: Vec<FeatureData>,
}

impl LayerData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            features: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Encodes layers into tile protobuf bytes, preserving layer order.
/// Layers without features are skipped.
pub fn encode(layers: Vec<LayerData>) -> Vec<u8> {
    let tile = Tile {
        layers: layers
            .into_iter()
            .filter(|layer| !layer.is_empty())
            .map(encode_layer)
            .collect(),
    };
    tile.encode_to_vec()
}

/// Decodes finished tiles (gzipped or plain) and concatenates their layers
/// into one tile, in input order.
pub fn merge(parts: &[Vec<u8>]) -> Result<Vec<u8>, MvtError> {
    let mut layers = Vec::new();
    for part in parts {
        let plain = gunzip_if_needed(part)?;
        let tile =
            Tile::decode(plain.as_slice()).map_err(|e| MvtError::Decode(e.to_string()))?;
        layers.extend(tile.layers);
    }
    Ok(Tile { layers }.encode_to_vec())
}

/// True when the payload carries the gzip magic.
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() > 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

fn gunzip_if_needed(bytes: &[u8]) -> Result<Vec<u8>, MvtError> {
    if is_gzip(bytes) {
        let mut plain = Vec::new();
        flate2::read::GzDecoder::new(bytes).read_to_end(&mut plain)?;
        Ok(plain)
    } else {
        Ok(bytes.to_vec())
    }
}

/// Hashable stand-in for `Value`, used for interning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ValueKey {
    Str(String),
    Float(u64),
    Int(i64),
    Bool(bool),
}

struct LayerEncoder {
    keys: Vec<String>,
    values: Vec<Value>,
    key_index: HashMap<String, u32>,
    value_index: HashMap<ValueKey, u32>,
}

impl LayerEncoder {
    fn new() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            key_index: HashMap::new(),
            value_index: HashMap::new(),
        }
    }

    fn key_id(&mut self, key: &str) -> u32 {
        if let Some(&id) = self.key_index.get(key) {
            return id;
        }
        let id = self.keys.len() as u32;
        self.keys.push(key.to_string());
        self.key_index.insert(key.to_string(), id);
        id
    }

    /// Interns a value; integers outside the signed 32-bit range are
    /// rejected because consumers refuse them.
    fn value_id(&mut self, value: &PropValue) -> Option<u32> {
        let (key, encoded) = match value {
            PropValue::Str(s) => (
                ValueKey::Str(s.clone()),
                Value {
                    string_value: Some(s.clone()),
                    ..Default::default()
                },
            ),
            PropValue::Float(f) => (
                ValueKey::Float(f.to_bits()),
                Value {
                    double_value: Some(*f),
                    ..Default::default()
                },
            ),
            PropValue::Int(i) => {
                if i32::try_from(*i).is_err() {
                    return None;
                }
                (
                    ValueKey::Int(*i),
                    Value {
                        int_value: Some(*i),
                        ..Default::default()
                    },
                )
            }
            PropValue::Bool(b) => (
                ValueKey::Bool(*b),
                Value {
                    bool_value: Some(*b),
                    ..Default::default()
                },
            ),
        };
        if let Some(&id) = self.value_index.get(&key) {
            return Some(id);
        }
        let id = self.values.len() as u32;
        self.values.push(encoded);
        self.value_index.insert(key, id);
        Some(id)
    }
}

fn encode_layer(layer: LayerData) -> Layer {
    let mut encoder = LayerEncoder::new();
    let mut features = Vec::with_capacity(layer.features.len());

    for feature in layer.features {
        let mut tags = Vec::with_capacity(feature.properties.len() * 2);
        for (key, value) in &feature.properties {
            if let Some(value_id) = encoder.value_id(value) {
                tags.push(encoder.key_id(key));
                tags.push(value_id);
            }
        }

        let (geom_type, geometry) = encode_geometry(&feature.geometry);
        if geometry.is_empty() {
            continue;
        }

        let mut encoded = Feature {
            tags,
            geometry,
            ..Default::default()
        };
        encoded.set_type(geom_type);
        features.push(encoded);
    }

    let mut out = Layer::default();
    out.version = 2;
    out.name = layer.name;
    out.features = features;
    out.keys = encoder.keys;
    out.values = encoder.values;
    out.extent = Some(EXTENT);
    out
}

fn command(id: u32, count: u32) -> u32 {
    (id & 0x7) | (count << 3)
}

fn zigzag(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

struct Cursor {
    x: i32,
    y: i32,
}

impl Cursor {
    fn new() -> Self {
        Self { x: 0, y: 0 }
    }

    fn push_delta(&mut self, out: &mut Vec<u32>, point: (i32, i32)) {
        out.push(zigzag(point.0 - self.x));
        out.push(zigzag(point.1 - self.y));
        self.x = point.0;
        self.y = point.1;
    }
}

fn encode_geometry(geometry: &Geometry) -> (GeomType, Vec<u32>) {
    let mut out = Vec::new();
    let mut cursor = Cursor::new();

    match geometry {
        Geometry::Points(points) => {
            if !points.is_empty() {
                out.push(command(CMD_MOVE_TO, points.len() as u32));
                for &point in points {
                    cursor.push_delta(&mut out, point);
                }
            }
            (GeomType::Point, out)
        }
        Geometry::Lines(lines) => {
            for line in lines {
                if line.len() < 2 {
                    continue;
                }
                out.push(command(CMD_MOVE_TO, 1));
                cursor.push_delta(&mut out, line[0]);
                out.push(command(CMD_LINE_TO, (line.len() - 1) as u32));
                for &point in &line[1..] {
                    cursor.push_delta(&mut out, point);
                }
            }
            (GeomType::Linestring, out)
        }
        Geometry::Polygons(polygons) => {
            for rings in polygons {
                for (i, ring) in rings.iter().enumerate() {
                    let ring = normalize_ring(ring, i == 0);
                    if ring.len() < 3 {
                        continue;
                    }
                    out.push(command(CMD_MOVE_TO, 1));
                    cursor.push_delta(&mut out, ring[0]);
                    out.push(command(CMD_LINE_TO, (ring.len() - 1) as u32));
                    for &point in &ring[1..] {
                        cursor.push_delta(&mut out, point);
                    }
                    out.push(command(CMD_CLOSE_PATH, 1));
                }
            }
            (GeomType::Polygon, out)
        }
    }
}

/// Twice the signed ring area by the surveyor's formula; positive means the
/// winding an exterior ring must have.
fn ring_area2(ring: &[(i32, i32)]) -> i64 {
    let mut sum = 0i64;
    for i in 0..ring.len() {
        let (x0, y0) = ring[i];
        let (x1, y1) = ring[(i + 1) % ring.len()];
        sum += x0 as i64 * y1 as i64 - x1 as i64 * y0 as i64;
    }
    sum
}

/// Drops the explicit closing point and fixes the winding for the ring's
/// role (exterior or hole).
fn normalize_ring(ring: &[(i32, i32)], exterior: bool) -> Vec<(i32, i32)> {
    let mut points: Vec<(i32, i32)> = ring.to_vec();
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    points.dedup();
    if points.len() < 3 {
        return points;
    }
    let area = ring_area2(&points);
    if (exterior && area < 0) || (!exterior && area > 0) {
        points.reverse();
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Tile {
        Tile::decode(bytes).unwrap()
    }

    fn point_layer() -> LayerData {
        LayerData {
            name: "soundings".to_string(),
            features: vec![FeatureData {
                geometry: Geometry::Points(vec![(100, 200)]),
                properties: vec![("depth".to_string(), PropValue::Float(12.5))],
            }],
        }
    }

    #[test]
    fn encodes_point_geometry() {
        let tile = decode(&encode(vec![point_layer()]));
        assert_eq!(tile.layers.len(), 1);
        let layer = &tile.layers[0];
        assert_eq!(layer.name, "soundings");
        assert_eq!(layer.extent, Some(4096));
        assert_eq!(layer.version, 2);

        let feature = &layer.features[0];
        assert_eq!(feature.r#type(), GeomType::Point);
        // MoveTo(1), zigzag(100), zigzag(200)
        assert_eq!(feature.geometry, vec![9, 200, 400]);
    }

    #[test]
    fn encodes_line_with_deltas() {
        let layer = LayerData {
            name: "contours".to_string(),
            features: vec![FeatureData {
                geometry: Geometry::Lines(vec![vec![(2, 2), (2, 10), (10, 10)]]),
                properties: vec![("ele".to_string(), PropValue::Int(100))],
            }],
        };
        let tile = decode(&encode(vec![layer]));
        let feature = &tile.layers[0].features[0];
        assert_eq!(feature.r#type(), GeomType::Linestring);
        assert_eq!(
            feature.geometry,
            vec![9, 4, 4, command(CMD_LINE_TO, 2), 0, 16, 16, 0]
        );
    }

    /// Walks a command stream back into rings of absolute points.
    fn decode_rings(geometry: &[u32]) -> Vec<Vec<(i32, i32)>> {
        let unzig = |v: u32| ((v >> 1) as i32) ^ -((v & 1) as i32);
        let mut rings = Vec::new();
        let mut current = Vec::new();
        let (mut x, mut y) = (0i32, 0i32);
        let mut i = 0;
        while i < geometry.len() {
            let cmd = geometry[i] & 0x7;
            let count = (geometry[i] >> 3) as usize;
            i += 1;
            match cmd {
                CMD_MOVE_TO | CMD_LINE_TO => {
                    for _ in 0..count {
                        x += unzig(geometry[i]);
                        y += unzig(geometry[i + 1]);
                        current.push((x, y));
                        i += 2;
                    }
                }
                CMD_CLOSE_PATH => rings.push(std::mem::take(&mut current)),
                other => panic!("unexpected command {other}"),
            }
        }
        rings
    }

    #[test]
    fn polygon_rings_close_and_wind_correctly() {
        // Exterior given counter-clockwise; encoder must flip it.
        let outer = vec![(0, 0), (0, 10), (10, 10), (10, 0)];
        let hole = vec![(2, 2), (8, 2), (8, 8), (2, 8)];
        let layer = LayerData {
            name: "depth_areas".to_string(),
            features: vec![FeatureData {
                geometry: Geometry::Polygons(vec![vec![outer, hole]]),
                properties: vec![],
            }],
        };
        let tile = decode(&encode(vec![layer]));
        let rings = decode_rings(&tile.layers[0].features[0].geometry);

        assert_eq!(rings.len(), 2);
        assert!(ring_area2(&rings[0]) > 0, "exterior must wind positively");
        assert!(ring_area2(&rings[1]) < 0, "hole must wind negatively");
    }

    #[test]
    fn oversized_integers_are_dropped() {
        let layer = LayerData {
            name: "test".to_string(),
            features: vec![FeatureData {
                geometry: Geometry::Points(vec![(0, 0)]),
                properties: vec![
                    ("big".to_string(), PropValue::Int(i64::from(i32::MAX) + 1)),
                    ("ok".to_string(), PropValue::Int(7)),
                ],
            }],
        };
        let tile = decode(&encode(vec![layer]));
        let layer = &tile.layers[0];
        assert_eq!(layer.keys, vec!["ok"]);
        assert_eq!(layer.features[0].tags, vec![0, 0]);
    }

    #[test]
    fn values_are_interned() {
        let layer = LayerData {
            name: "test".to_string(),
            features: vec![
                FeatureData {
                    geometry: Geometry::Points(vec![(0, 0)]),
                    properties: vec![("depth".to_string(), PropValue::Float(5.0))],
                },
                FeatureData {
                    geometry: Geometry::Points(vec![(1, 1)]),
                    properties: vec![("depth".to_string(), PropValue::Float(5.0))],
                },
            ],
        };
        let tile = decode(&encode(vec![layer]));
        let layer = &tile.layers[0];
        assert_eq!(layer.keys.len(), 1);
        assert_eq!(layer.values.len(), 1);
    }

    #[test]
    fn empty_layers_are_skipped() {
        let bytes = encode(vec![LayerData::new("empty"), point_layer()]);
        let tile = decode(&bytes);
        assert_eq!(tile.layers.len(), 1);
        assert_eq!(tile.layers[0].name, "soundings");
    }

    #[test]
    fn merge_concatenates_layers_in_order() {
        let a = encode(vec![LayerData {
            name: "water".to_string(),
            features: vec![FeatureData {
                geometry: Geometry::Points(vec![(1, 1)]),
                properties: vec![],
            }],
        }]);
        let b = encode(vec![point_layer()]);

        let merged = decode(&merge(&[a, b]).unwrap());
        let names: Vec<_> = merged.layers.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["water", "soundings"]);
    }

    #[test]
    fn merge_accepts_gzipped_parts() {
        use flate2::write::GzEncoder;
        use std::io::Write;

        let plain = encode(vec![point_layer()]);
        let mut gz = GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&plain).unwrap();
        let compressed = gz.finish().unwrap();
        assert!(is_gzip(&compressed));

        let merged = decode(&merge(&[compressed]).unwrap());
        assert_eq!(merged.layers[0].name, "soundings");
    }
}
