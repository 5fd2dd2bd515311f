use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use tracing::{info, warn};

use feature_pipeline::config::Config;
use feature_pipeline::dashboard::{self, AppState};
use feature_pipeline::features::builtin_definitions;
use feature_pipeline::pipeline::FeaturePipeline;
use feature_pipeline::registry::{FeatureManifest, FeatureRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    // Feature registry: built-ins, optionally narrowed by a manifest
    let registry = match &config.feature_manifest {
        Some(path) => {
            let manifest = FeatureManifest::load(path)?;
            info!(
                "Loaded feature manifest {} ({} entries)",
                path,
                manifest.features.len()
            );
            FeatureRegistry::with_manifest(builtin_definitions(), &manifest)?
        }
        None => FeatureRegistry::builtin()?,
    };

    let cache = config.build_cache()?;
    info!("Cache backend: {}", cache.backend_name());
    if !cache.is_healthy().await {
        warn!("⚠️ Cache backend unhealthy at startup – serving uncached");
    }

    let pipeline = FeaturePipeline::new(registry, cache, config.policy());

    let app = dashboard::router(AppState { pipeline });
    let addr: SocketAddr = config.listen_addr.parse()?;
    info!("Feature API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app).await?;

    Ok(())
}
