//! Isoline and isoband generation.
//!
//! Marching squares over a corner-aligned elevation grid. The tracer always
//! produces closed rings: the grid is padded with below-threshold corners,
//! so a region running off the data closes along the tile border after
//! clamping. Open contour lines fall out of the same rings by dropping the
//! border-lying points; isobands come from combining the rings of two
//! adjacent thresholds and partitioning them into outer rings and holes.
//!
//! Ring orientation is fixed by the tracing convention: the at-or-above
//! region keeps to the left of the travel direction, which makes rings that
//! enclose high ground clockwise in tile coordinates (negative signed area)
//! and depression rings counter-clockwise (positive).

use crate::terrain::HeightTile;

/// Contour spacing in metres for land elevations by zoom.
pub fn contour_interval(zoom: u8) -> i32 {
    match zoom {
        z if z >= 14 => 10,
        13 => 20,
        12 => 50,
        z if z >= 10 => 100,
        z if z >= 8 => 200,
        _ => 500,
    }
}

/// A closed ring in tile-extent coordinates. The closing point is implicit.
#[derive(Debug, Clone)]
pub struct Ring {
    pub points: Vec<(f32, f32)>,
    /// Signed area: negative for rings winding clockwise in tile space.
    pub area: f32,
    /// Grid coordinate near the ring's first point, for elevation sampling.
    pub sample_at: (i32, i32),
}

impl Ring {
    pub fn is_outer(&self) -> bool {
        self.area < 0.0
    }
}

/// A closed-polygon isoband between two thresholds.
#[derive(Debug, Clone)]
pub struct Band {
    pub lower: f32,
    pub upper: f32,
    pub polygons: Vec<BandPolygon>,
    /// Interior line runs along the band's deeper boundary.
    pub label_lines: Vec<Vec<(i32, i32)>>,
}

#[derive(Debug, Clone)]
pub struct BandPolygon {
    pub outer: Vec<(i32, i32)>,
    pub holes: Vec<Vec<(i32, i32)>>,
}

/// Traces the closed rings of the region `elevation >= threshold`.
///
/// The tile must be corner-aligned with a one-pixel materialized margin.
/// Coordinates are scaled to `0..=extent` and clamped to the tile.
pub fn rings(tile: &HeightTile, threshold: f32, extent: u32) -> Vec<Ring> {
    Tracer::new(tile, threshold).run(extent)
}

/// Generates open isolines at each threshold.
///
/// Every returned polyline consists of consecutive points strictly inside
/// the tile; runs shorter than two points are discarded. A ring that never
/// touches the border is emitted as a single closed polyline.
pub fn isolines(tile: &HeightTile, levels: &[f32], extent: u32) -> Vec<(f32, Vec<Vec<(i32, i32)>>)> {
    levels
        .iter()
        .map(|&level| {
            let lines: Vec<Vec<(i32, i32)>> = rings(tile, level, extent)
                .iter()
                .flat_map(|ring| interior_runs(&ring.points, extent))
                .collect();
            (level, lines)
        })
        .filter(|(_, lines)| !lines.is_empty())
        .collect()
}

/// Generates isobands for each adjacent pair of `levels` (ascending).
pub fn isobands(tile: &HeightTile, levels: &[f32], extent: u32) -> Vec<Band> {
    if levels.len() < 2 {
        return Vec::new();
    }
    let per_level: Vec<Vec<Ring>> = levels.iter().map(|&t| rings(tile, t, extent)).collect();

    levels
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            let (lower, upper) = (pair[0], pair[1]);
            let mut band_rings: Vec<Ring> = per_level[i].clone();
            band_rings.extend(per_level[i + 1].iter().map(reverse_ring));
            build_band(tile, lower, upper, band_rings, extent)
        })
        .filter(|band| !band.polygons.is_empty())
        .collect()
}

fn reverse_ring(ring: &Ring) -> Ring {
    let mut points = ring.points.clone();
    points.reverse();
    Ring {
        points,
        area: -ring.area,
        sample_at: ring.sample_at,
    }
}

/// Partitions rings into polygons and extracts the deeper-boundary lines.
fn build_band(tile: &HeightTile, lower: f32, upper: f32, rings: Vec<Ring>, extent: u32) -> Band {
    let mut label_lines = Vec::new();
    let mut outers: Vec<&Ring> = Vec::new();
    let mut holes: Vec<&Ring> = Vec::new();

    for ring in &rings {
        let elevation = tile.get(ring.sample_at.0, ring.sample_at.1);
        if !elevation.is_finite() {
            continue;
        }
        if (elevation - lower).abs() < (elevation - upper).abs() {
            label_lines.extend(interior_runs(&ring.points, extent));
        }
        if ring.is_outer() {
            outers.push(ring);
        } else {
            holes.push(ring);
        }
    }

    // Assign each hole to the smallest outer ring containing it.
    let mut assigned: Vec<Vec<&Ring>> = vec![Vec::new(); outers.len()];
    for hole in holes {
        let Some(&probe) = hole.points.first() else {
            continue;
        };
        let owner = outers
            .iter()
            .enumerate()
            .filter(|(_, outer)| point_in_ring(probe, &outer.points))
            .min_by(|(_, a), (_, b)| {
                a.area.abs().partial_cmp(&b.area.abs()).unwrap()
            })
            .map(|(idx, _)| idx);
        if let Some(idx) = owner {
            assigned[idx].push(hole);
        }
    }

    // A polygon whose holes eat its whole interior (the band range never
    // occurs inside the ring) carries no geometry and is dropped.
    let polygons = outers
        .iter()
        .zip(assigned)
        .filter(|(outer, holes)| {
            let net = outer.area.abs() - holes.iter().map(|h| h.area.abs()).sum::<f32>();
            net > 1.0
        })
        .map(|(outer, holes)| BandPolygon {
            outer: round_points(&outer.points),
            holes: holes.iter().map(|h| round_points(&h.points)).collect(),
        })
        .collect();

    Band {
        lower,
        upper,
        polygons,
        label_lines,
    }
}

/// Splits a closed ring into maximal runs of points strictly inside the
/// tile. Runs of fewer than two points are dropped; a ring with no border
/// contact comes back as one closed polyline.
fn interior_runs(points: &[(f32, f32)], extent: u32) -> Vec<Vec<(i32, i32)>> {
    let extent = extent as f32;
    let inside =
        |p: &(f32, f32)| p.0 > 0.0 && p.0 < extent && p.1 > 0.0 && p.1 < extent;

    if points.iter().all(inside) {
        let mut line = round_points(points);
        if let Some(&first) = line.first() {
            line.push(first);
        }
        return vec![line];
    }

    // Rotate so the walk starts on a border point, keeping runs contiguous.
    let start = points.iter().position(|p| !inside(p)).unwrap();
    let mut runs = Vec::new();
    let mut current: Vec<(i32, i32)> = Vec::new();
    for i in 0..points.len() {
        let p = &points[(start + i) % points.len()];
        if inside(p) {
            current.push(round_point(p));
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs.retain(|run| run.len() >= 2);
    runs
}

fn round_point(p: &(f32, f32)) -> (i32, i32) {
    (p.0.round() as i32, p.1.round() as i32)
}

fn round_points(points: &[(f32, f32)]) -> Vec<(i32, i32)> {
    let mut out: Vec<(i32, i32)> = points.iter().map(round_point).collect();
    out.dedup();
    out
}

/// Even-odd ray cast.
fn point_in_ring(point: (f32, f32), ring: &[(f32, f32)]) -> bool {
    let (px, py) = point;
    let mut inside = false;
    let n = ring.len();
    for i in 0..n {
        let (x0, y0) = ring[i];
        let (x1, y1) = ring[(i + 1) % n];
        if (y0 > py) != (y1 > py) {
            let cross_x = x0 + (py - y0) / (y1 - y0) * (x1 - x0);
            if px < cross_x {
                inside = !inside;
            }
        }
    }
    inside
}

/// Signed ring area, negative for clockwise in tile coordinates.
fn signed_area(points: &[(f32, f32)]) -> f32 {
    let n = points.len();
    let mut sum = 0.0;
    for i in 0..n {
        let (x0, y0) = points[i];
        let (x1, y1) = points[(i + 1) % n];
        sum += (x1 - x0) * (y1 + y0);
    }
    sum / 2.0
}

/// Edge identifiers of one marching-squares cell.
#[derive(Clone, Copy)]
enum Edge {
    Top,
    Right,
    Bottom,
    Left,
}

struct Tracer<'a> {
    tile: &'a HeightTile,
    threshold: f32,
    /// Substitute for padding and unknown samples; always below threshold.
    below: f32,
    width: i32,
    height: i32,
}

type Point = (f32, f32);
type Key = (u32, u32);

fn key(p: Point) -> Key {
    (p.0.to_bits(), p.1.to_bits())
}

impl<'a> Tracer<'a> {
    /// Margin provided by the materialized tile.
    const BUFFER: i32 = 1;

    fn new(tile: &'a HeightTile, threshold: f32) -> Self {
        Self {
            tile,
            threshold,
            below: threshold - 1.0,
            width: tile.width as i32,
            height: tile.height as i32,
        }
    }

    /// Corner sample with padding: outside the margin, and wherever the
    /// data is unknown, the grid reads as below-threshold.
    fn sample(&self, x: i32, y: i32) -> f32 {
        if x < -Self::BUFFER
            || y < -Self::BUFFER
            || x >= self.width + Self::BUFFER
            || y >= self.height + Self::BUFFER
        {
            return self.below;
        }
        let v = self.tile.get(x, y);
        if v.is_nan() {
            self.below
        } else {
            v
        }
    }

    fn crossing(&self, cx: i32, cy: i32, edge: Edge) -> Point {
        let t = self.threshold;
        let frac = |a: f32, b: f32| ((t - a) / (b - a)).clamp(0.0, 1.0);
        match edge {
            Edge::Top => {
                let (a, b) = (self.sample(cx, cy), self.sample(cx + 1, cy));
                (cx as f32 + frac(a, b), cy as f32)
            }
            Edge::Bottom => {
                let (a, b) = (self.sample(cx, cy + 1), self.sample(cx + 1, cy + 1));
                (cx as f32 + frac(a, b), (cy + 1) as f32)
            }
            Edge::Left => {
                let (a, b) = (self.sample(cx, cy), self.sample(cx, cy + 1));
                (cx as f32, cy as f32 + frac(a, b))
            }
            Edge::Right => {
                let (a, b) = (self.sample(cx + 1, cy), self.sample(cx + 1, cy + 1));
                ((cx + 1) as f32, cy as f32 + frac(a, b))
            }
        }
    }

    fn run(&self, extent: u32) -> Vec<Ring> {
        use Edge::{Bottom as B, Left as L, Right as R, Top as T};

        let mut stitcher = Stitcher::default();
        let lo = -Self::BUFFER - 1;

        for cy in lo..self.height + Self::BUFFER {
            for cx in lo..self.width + Self::BUFFER {
                let tl = self.sample(cx, cy) >= self.threshold;
                let tr = self.sample(cx + 1, cy) >= self.threshold;
                let br = self.sample(cx + 1, cy + 1) >= self.threshold;
                let bl = self.sample(cx, cy + 1) >= self.threshold;
                let case =
                    (tl as u8) | (tr as u8) << 1 | (br as u8) << 2 | (bl as u8) << 3;
                if case == 0 || case == 15 {
                    continue;
                }

                let segments: &[(Edge, Edge)] = match case {
                    1 => &[(T, L)],
                    2 => &[(R, T)],
                    3 => &[(R, L)],
                    4 => &[(B, R)],
                    5 => {
                        if self.center_above(cx, cy) {
                            &[(T, R), (B, L)]
                        } else {
                            &[(T, L), (B, R)]
                        }
                    }
                    6 => &[(B, T)],
                    7 => &[(B, L)],
                    8 => &[(L, B)],
                    9 => &[(T, B)],
                    10 => {
                        if self.center_above(cx, cy) {
                            &[(L, T), (R, B)]
                        } else {
                            &[(R, T), (L, B)]
                        }
                    }
                    11 => &[(R, B)],
                    12 => &[(L, R)],
                    13 => &[(T, R)],
                    14 => &[(L, T)],
                    _ => unreachable!(),
                };

                for &(from, to) in segments {
                    let p = self.crossing(cx, cy, from);
                    let q = self.crossing(cx, cy, to);
                    if key(p) != key(q) {
                        stitcher.add(p, q);
                    }
                }
            }
        }

        let multiplier = extent as f32 / (self.width - 1) as f32;
        stitcher
            .rings
            .into_iter()
            .filter_map(|ring| self.finish_ring(ring, multiplier, extent))
            .collect()
    }

    fn center_above(&self, cx: i32, cy: i32) -> bool {
        let sum = self.sample(cx, cy)
            + self.sample(cx + 1, cy)
            + self.sample(cx + 1, cy + 1)
            + self.sample(cx, cy + 1);
        sum / 4.0 >= self.threshold
    }

    /// Scales a grid-space ring to tile coordinates, clamps it to the tile
    /// and drops degenerate results.
    fn finish_ring(&self, grid_points: Vec<Point>, multiplier: f32, extent: u32) -> Option<Ring> {
        let first = *grid_points.first()?;
        let sample_at = (
            (first.0.round() as i32).clamp(0, self.width - 1),
            (first.1.round() as i32).clamp(0, self.height - 1),
        );

        let extent = extent as f32;
        let mut points: Vec<Point> = grid_points
            .into_iter()
            .map(|(x, y)| {
                (
                    (x * multiplier).clamp(0.0, extent),
                    (y * multiplier).clamp(0.0, extent),
                )
            })
            .collect();
        points.dedup_by(|a, b| key(*a) == key(*b));
        while points.len() > 1 && key(points[0]) == key(*points.last().unwrap()) {
            points.pop();
        }
        if points.len() < 3 {
            return None;
        }

        let area = signed_area(&points);
        if area.abs() < 1.0 {
            return None;
        }
        Some(Ring {
            points,
            area,
            sample_at,
        })
    }
}

/// Joins directed segments into closed rings by matching endpoints.
#[derive(Default)]
struct Stitcher {
    fragments: Vec<Option<Vec<Point>>>,
    by_start: std::collections::HashMap<Key, usize>,
    by_end: std::collections::HashMap<Key, usize>,
    rings: Vec<Vec<Point>>,
}

impl Stitcher {
    fn add(&mut self, p: Point, q: Point) {
        let ends_at_p = self.by_end.remove(&key(p));
        let starts_at_q = self.by_start.remove(&key(q));

        match (ends_at_p, starts_at_q) {
            (Some(left), Some(right)) if left == right => {
                // The segment closes the fragment into a ring.
                let ring = self.fragments[left].take().unwrap();
                self.rings.push(ring);
            }
            (Some(left), Some(right)) => {
                // Bridge two fragments: left ... p -> q ... right.
                let tail = self.fragments[right].take().unwrap();
                let fragment = self.fragments[left].as_mut().unwrap();
                fragment.extend(tail);
                let end = *fragment.last().unwrap();
                self.by_end.insert(key(end), left);
            }
            (Some(left), None) => {
                let fragment = self.fragments[left].as_mut().unwrap();
                fragment.push(q);
                self.by_end.insert(key(q), left);
            }
            (None, Some(right)) => {
                let fragment = self.fragments[right].as_mut().unwrap();
                fragment.insert(0, p);
                self.by_start.insert(key(p), right);
            }
            (None, None) => {
                let idx = self.fragments.len();
                self.fragments.push(Some(vec![p, q]));
                self.by_start.insert(key(p), idx);
                self.by_end.insert(key(q), idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTENT: u32 = 4096;

    /// Radial tile: elevation = peak - distance from center.
    fn cone(size: u32, peak: f32) -> HeightTile {
        let mut data = Vec::with_capacity((size * size) as usize);
        let c = (size - 1) as f32 / 2.0;
        for y in 0..size {
            for x in 0..size {
                let r = ((x as f32 - c).powi(2) + (y as f32 - c).powi(2)).sqrt();
                data.push(peak - r);
            }
        }
        HeightTile::from_raster(size, size, data)
    }

    #[test]
    fn interval_ladder() {
        assert_eq!(contour_interval(15), 10);
        assert_eq!(contour_interval(14), 10);
        assert_eq!(contour_interval(13), 20);
        assert_eq!(contour_interval(12), 50);
        assert_eq!(contour_interval(10), 100);
        assert_eq!(contour_interval(8), 200);
        assert_eq!(contour_interval(5), 500);
    }

    #[test]
    fn peak_produces_single_clockwise_ring() {
        let tile = cone(33, 10.0);
        let rings = rings(&tile, 5.0, EXTENT);
        assert_eq!(rings.len(), 1);
        let ring = &rings[0];
        assert!(ring.is_outer(), "peak ring must be an outer ring");
        // A circle of radius 5 grid units scaled by 4096/32.
        let expected_area = std::f32::consts::PI * (5.0 * 128.0) * (5.0 * 128.0);
        assert!(
            (ring.area.abs() - expected_area).abs() / expected_area < 0.1,
            "area {} vs {}",
            ring.area.abs(),
            expected_area
        );
    }

    #[test]
    fn depression_ring_is_counter_clockwise() {
        // Invert the cone: a pit in high ground.
        let tile = cone(33, 10.0);
        let mut data = Vec::new();
        for y in 0..33 {
            for x in 0..33 {
                data.push(20.0 - tile.get(x, y));
            }
        }
        let pit = HeightTile::from_raster(33, 33, data);
        let rings = rings(&pit, 12.0, EXTENT);
        // One ring around the pit plus the border ring of the covered tile.
        let inner: Vec<_> = rings.iter().filter(|r| !r.is_outer()).collect();
        assert_eq!(inner.len(), 1, "pit must be a hole ring");
    }

    #[test]
    fn flooded_tile_produces_border_ring() {
        let tile = HeightTile::from_raster(17, 17, vec![100.0; 17 * 17]);
        let rings = rings(&tile, 50.0, EXTENT);
        assert_eq!(rings.len(), 1);
        let ring = &rings[0];
        assert!(ring.is_outer());
        // Covers the whole tile.
        assert!(ring.area.abs() > (EXTENT as f32).powi(2) * 0.99);
        // Every point is clamped onto the border.
        for &(x, y) in &ring.points {
            let on_border =
                x == 0.0 || y == 0.0 || x == EXTENT as f32 || y == EXTENT as f32;
            assert!(on_border, "({x}, {y}) not on border");
        }
    }

    #[test]
    fn empty_threshold_produces_nothing() {
        let tile = cone(33, 10.0);
        assert!(rings(&tile, 1000.0, EXTENT).is_empty());
    }

    #[test]
    fn isoline_of_interior_ring_is_closed() {
        let tile = cone(33, 10.0);
        let result = isolines(&tile, &[5.0], EXTENT);
        assert_eq!(result.len(), 1);
        let (level, lines) = &result[0];
        assert_eq!(*level, 5.0);
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert_eq!(line.first(), line.last(), "interior isoline must close");
    }

    #[test]
    fn isoline_crossing_border_is_split_open() {
        // A west-east ridge: high values on the left half.
        let mut data = Vec::new();
        for _y in 0..17 {
            for x in 0..17 {
                data.push(if x < 8 { 100.0 } else { 0.0 });
            }
        }
        let tile = HeightTile::from_raster(17, 17, data);
        let result = isolines(&tile, &[50.0], EXTENT);
        let (_, lines) = &result[0];
        assert!(!lines.is_empty());
        for line in lines {
            assert!(line.len() >= 2);
            assert_ne!(line.first(), line.last(), "border-crossing line is open");
        }
    }

    #[test]
    fn isobands_of_cone_form_annuli() {
        let tile = cone(65, 0.0).materialize(1);
        // Depth bands 2..5 and 5..10 on a -r surface.
        let bands = isobands(&tile, &[-10.0, -5.0, -2.0], EXTENT);
        assert_eq!(bands.len(), 2);

        for band in &bands {
            assert_eq!(band.polygons.len(), 1, "band {:?}", (band.lower, band.upper));
            let polygon = &band.polygons[0];
            assert_eq!(polygon.holes.len(), 1, "annulus needs one hole");
            assert!(!band.label_lines.is_empty(), "deeper boundary labels missing");
        }

        let outer_band = &bands[0]; // [-10, -5)
        assert_eq!(outer_band.lower, -10.0);
        assert_eq!(outer_band.upper, -5.0);
    }

    #[test]
    fn isobands_skip_empty_ranges() {
        let tile = cone(33, 0.0).materialize(1);
        // The surface never reaches -100.
        let bands = isobands(&tile, &[-200.0, -100.0], EXTENT);
        assert!(bands.is_empty());
    }

    #[test]
    fn band_label_lines_sit_on_deeper_boundary() {
        let tile = cone(65, 0.0).materialize(1);
        let bands = isobands(&tile, &[-10.0, -5.0, -2.0], EXTENT);
        let band = &bands[0]; // [-10, -5)

        // Label lines follow the r = 10 circle: radius in tile units.
        let c = EXTENT as f32 / 2.0;
        let radius = 10.0 * EXTENT as f32 / 64.0;
        for line in &band.label_lines {
            for &(x, y) in line {
                let r = ((x as f32 - c).powi(2) + (y as f32 - c).powi(2)).sqrt();
                assert!(
                    (r - radius).abs() < radius * 0.2,
                    "label point ({x},{y}) at r={r}, expected ~{radius}"
                );
            }
        }
    }

    #[test]
    fn point_in_ring_basics() {
        let square = vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        assert!(point_in_ring((5.0, 5.0), &square));
        assert!(!point_in_ring((15.0, 5.0), &square));
    }
}
