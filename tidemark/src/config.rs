//! Server configuration.
//!
//! All paths are provided by the embedding host; nothing is read from
//! environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the tile pipeline and HTTP layer.
#[derive(Debug, Clone)]
pub struct TidemarkConfig {
    /// Root of the offline sector archives.
    pub pmtiles_path: PathBuf,
    /// Directory holding prebuilt styles, sprites and glyphs.
    pub style_path: PathBuf,
    /// Root of the raw tile cache.
    pub tiles_path: PathBuf,
    /// Root of the derived (contour/bathymetry/soundings/composite) cache.
    pub derived_path: PathBuf,
    /// Isoband depth levels in metres, positive, ascending.
    pub depth_levels: Vec<f64>,
    /// Age under which an offline or cached tile is served without
    /// consulting the network.
    pub freshness_window: Duration,
    /// Bound on concurrently open local archive readers.
    pub max_open_archives: usize,
    /// Externally visible base URL, used in TileJSON templates.
    pub base_url: String,
}

impl TidemarkConfig {
    /// Builds a configuration rooted at a single data directory, using the
    /// conventional subdirectory layout.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            pmtiles_path: data_dir.join("pmtiles"),
            style_path: data_dir.join("styles"),
            tiles_path: data_dir.join("cache"),
            derived_path: data_dir.join("cache"),
            depth_levels: default_depth_levels(),
            freshness_window: DEFAULT_FRESHNESS,
            max_open_archives: DEFAULT_MAX_OPEN_ARCHIVES,
            base_url: "http://localhost:8080".to_string(),
        }
    }

    pub fn with_depth_levels(mut self, levels: Vec<f64>) -> Self {
        if !levels.is_empty() {
            self.depth_levels = levels;
        }
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Offline archives and cached tiles younger than this are considered fresh.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(7 * 24 * 3600);

/// Default bound for the archive reader pool.
pub const DEFAULT_MAX_OPEN_ARCHIVES: usize = 50;

fn default_depth_levels() -> Vec<f64> {
    vec![2.0, 5.0, 10.0, 20.0, 50.0]
}

/// Parses a comma-separated depth list, e.g. `"2,5,10,20,50"`.
///
/// Entries that do not parse as positive numbers are skipped; an empty result
/// falls back to the defaults.
pub fn parse_depth_levels(raw: &str) -> Vec<f64> {
    let mut levels: Vec<f64> = raw
        .split(',')
        .filter_map(|part| part.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
        .collect();
    levels.sort_by(|a, b| a.partial_cmp(b).unwrap());
    levels.dedup();
    if levels.is_empty() {
        default_depth_levels()
    } else {
        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_layout() {
        let config = TidemarkConfig::with_data_dir("/data");
        assert_eq!(config.pmtiles_path, PathBuf::from("/data/pmtiles"));
        assert_eq!(config.style_path, PathBuf::from("/data/styles"));
        assert_eq!(config.freshness_window, DEFAULT_FRESHNESS);
        assert_eq!(config.max_open_archives, 50);
    }

    #[test]
    fn parse_depth_levels_sorts_and_dedups() {
        assert_eq!(parse_depth_levels("10, 2,5,10"), vec![2.0, 5.0, 10.0]);
    }

    #[test]
    fn parse_depth_levels_skips_junk() {
        assert_eq!(parse_depth_levels("2,abc,-3,5"), vec![2.0, 5.0]);
    }

    #[test]
    fn parse_depth_levels_empty_falls_back() {
        assert_eq!(parse_depth_levels(""), vec![2.0, 5.0, 10.0, 20.0, 50.0]);
    }
}
