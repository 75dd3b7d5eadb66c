//! Tidemark CLI - serve marine navigation tiles.
//!
//! Parses host configuration from flags, wires up logging and runs the
//! HTTP server until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tidemark::config::{parse_depth_levels, TidemarkConfig};
use tidemark::server;
use tidemark::service::TidemarkCore;

#[derive(Debug, Parser)]
#[command(name = "tidemark", version = tidemark::VERSION, about = "Offline-first marine map tile server")]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    address: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Data directory (sector archives, caches, styles).
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Root of the offline sector archives; defaults to `<data-dir>/pmtiles`.
    #[arg(long)]
    pmtiles_path: Option<PathBuf>,

    /// Style/sprite/glyph directory; defaults to `<data-dir>/styles`.
    #[arg(long)]
    style_path: Option<PathBuf>,

    /// Tile cache root; defaults to `<data-dir>/cache`.
    #[arg(long)]
    cache_path: Option<PathBuf>,

    /// Comma-separated bathymetry depth levels in metres.
    #[arg(long, default_value = "2,5,10,20,50")]
    depths: String,

    /// Externally visible base URL for TileJSON templates.
    #[arg(long)]
    base_url: Option<String>,
}

fn build_config(args: &Args) -> TidemarkConfig {
    let mut config = TidemarkConfig::with_data_dir(&args.data_dir)
        .with_depth_levels(parse_depth_levels(&args.depths));
    if let Some(path) = &args.pmtiles_path {
        config.pmtiles_path = path.clone();
    }
    if let Some(path) = &args.style_path {
        config.style_path = path.clone();
    }
    if let Some(path) = &args.cache_path {
        config.tiles_path = path.clone();
        config.derived_path = path.clone();
    }
    if let Some(base_url) = &args.base_url {
        config.base_url = base_url.clone();
    } else {
        config.base_url = format!("http://{}:{}", args.address, args.port);
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let config = build_config(&args);
    info!(
        version = tidemark::VERSION,
        pmtiles = %config.pmtiles_path.display(),
        "starting tidemark"
    );

    let core = Arc::new(TidemarkCore::new(config));
    core.spawn_background();

    let addr: SocketAddr = format!("{}:{}", args.address, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let app = server::router(Arc::clone(&core));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    core.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_derive_from_data_dir() {
        let args = Args::parse_from(["tidemark", "--data-dir", "/srv/tidemark"]);
        let config = build_config(&args);
        assert_eq!(config.pmtiles_path, PathBuf::from("/srv/tidemark/pmtiles"));
        assert_eq!(config.style_path, PathBuf::from("/srv/tidemark/styles"));
        assert_eq!(config.base_url, "http://0.0.0.0:8080");
    }

    #[test]
    fn explicit_paths_override_data_dir() {
        let args = Args::parse_from([
            "tidemark",
            "--pmtiles-path",
            "/mnt/archives",
            "--depths",
            "5,15",
        ]);
        let config = build_config(&args);
        assert_eq!(config.pmtiles_path, PathBuf::from("/mnt/archives"));
        assert_eq!(config.depth_levels, vec![5.0, 15.0]);
    }
}
