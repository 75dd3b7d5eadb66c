//! Tidemark - offline-first map tiles for marine navigation
//!
//! Serves vector and raster tiles from five upstream sources through a
//! three-tier fallback (filesystem cache, offline sector archives, online
//! range fetch), orchestrates sector downloads via the external extraction
//! utility, and synthesizes depth contours, depth areas and spot soundings
//! from terrain-RGB rasters on demand.
//!
//! # High-Level API
//!
//! ```ignore
//! use tidemark::config::TidemarkConfig;
//! use tidemark::service::TidemarkCore;
//!
//! let core = std::sync::Arc::new(TidemarkCore::new(
//!     TidemarkConfig::with_data_dir("/var/lib/tidemark"),
//! ));
//! core.spawn_background();
//! let router = tidemark::server::router(core);
//! ```

pub mod archive;
pub mod config;
pub mod connectivity;
pub mod contour;
pub mod coord;
pub mod derived;
pub mod download;
pub mod mvt;
pub mod resolver;
pub mod server;
pub mod service;
pub mod soundings;
pub mod source;
pub mod store;
pub mod terrain;

/// Version of the Tidemark library and CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
