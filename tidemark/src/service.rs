//! Service facade.
//!
//! [`TidemarkCore`] is the single shared value behind the HTTP layer. It
//! owns every piece of process-wide state the design calls for — the
//! archive reader pool, the pending-request map inside the resolver, the
//! download state and the connectivity flag — each with its own
//! synchronization. There are no other singletons.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::archive::ArchivePool;
use crate::config::TidemarkConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::derived::DerivedTiles;
use crate::download::{utility_available, DownloadManager};
use crate::resolver::TileResolver;
use crate::source::SourceRegistry;
use crate::store::TileStore;

pub struct TidemarkCore {
    pub config: TidemarkConfig,
    pub sources: Arc<SourceRegistry>,
    pub resolver: Arc<TileResolver>,
    pub derived: DerivedTiles,
    pub downloads: DownloadManager,
    pub connectivity: Arc<ConnectivityMonitor>,
    pool: Arc<ArchivePool>,
}

impl TidemarkCore {
    pub fn new(config: TidemarkConfig) -> Self {
        Self::with_sources(config, Arc::new(SourceRegistry::defaults()))
    }

    pub fn with_sources(config: TidemarkConfig, sources: Arc<SourceRegistry>) -> Self {
        let offline_enabled = utility_available();
        if !offline_enabled {
            warn!(
                "extraction utility not on PATH; sector downloads disabled, \
                 offline tier skipped"
            );
        }

        let store = Arc::new(TileStore::new(&config.tiles_path));
        let derived_store = Arc::new(TileStore::new(&config.derived_path));
        let pool = Arc::new(ArchivePool::new(config.max_open_archives));
        let connectivity = Arc::new(ConnectivityMonitor::new());

        let resolver = Arc::new(TileResolver::new(
            Arc::clone(&sources),
            store,
            Arc::clone(&pool),
            Arc::clone(&connectivity),
            config.pmtiles_path.clone(),
            config.freshness_window,
            offline_enabled,
        ));

        let derived = DerivedTiles::new(
            Arc::clone(&sources),
            Arc::clone(&resolver),
            derived_store,
            config.depth_levels.clone(),
        );

        let downloads = DownloadManager::new(&config.pmtiles_path, Arc::clone(&sources));

        Self {
            config,
            sources,
            resolver,
            derived,
            downloads,
            connectivity,
            pool,
        }
    }

    /// Starts the background tasks (currently the connectivity probe).
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(url) = self.sources.probe_url() {
            handles.push(self.connectivity.spawn(url.to_string()));
            info!(probe = url, "connectivity monitor started");
        }
        handles
    }

    /// Releases pooled archive readers. Call on shutdown.
    pub async fn shutdown(&self) {
        self.downloads.cancel();
        self.pool.close_all().await;
    }
}
