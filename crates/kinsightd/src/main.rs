use anyhow::{Context, Result};
use kinsight_core::{IdentityStore, MemoryStore, ModelPaths, OnnxAdapter, Resolver};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod detection;
mod engine;
mod routes;
mod service;
mod store;
#[cfg(test)]
mod testing;

use config::{Config, DetectionMode, StoreBackend};
use detection::{DetectionBackend, RemoteDetector};
use service::IdentifyService;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "kinsightd starting");

    let (store, store_backend): (Arc<dyn IdentityStore>, &'static str) = match config.store.backend {
        StoreBackend::Sqlite => (Arc::new(store::SqliteStore::open(&config.store.db_path)?), "sqlite"),
        StoreBackend::Memory => {
            tracing::warn!("using in-memory identity store; identities are lost on restart");
            (Arc::new(MemoryStore::new()), "memory")
        }
    };

    let detection = match config.detection.mode {
        DetectionMode::Local => {
            let paths = ModelPaths::in_dir(&config.detection.model_dir);
            tracing::info!(
                scrfd = %paths.scrfd.display(),
                arcface = %paths.arcface.display(),
                "local detection"
            );
            let adapter = OnnxAdapter::new(paths, config.detection.intra_threads);
            let engine = engine::spawn_engine(Box::new(adapter))?;
            if config.detection.eager_warmup {
                engine.warm_up().await.context("failed to load detection models")?;
            }
            DetectionBackend::local(engine, config.detection.timeout())
        }
        DetectionMode::Remote => {
            tracing::info!(url = %config.detection.remote_url, "remote detection");
            let remote = RemoteDetector::new(
                &config.detection.remote_url,
                config.detection.timeout(),
                config.detection.health_timeout(),
            )?;
            if let Err(e) = remote.health().await {
                tracing::warn!(error = %e, "detection service not reachable yet");
            }
            DetectionBackend::Remote(remote)
        }
    };

    tracing::info!(
        threshold = config.matching.similarity_threshold,
        descriptor_dim = config.matching.descriptor_dim,
        min_face_confidence = config.detection.min_face_confidence,
        "identity resolver configured"
    );
    let service = IdentifyService::new(
        detection,
        store,
        store_backend,
        Resolver::new(config.matching.clone()),
        config.detection.min_face_confidence,
        config.store.timeout(),
    );

    let app = routes::router(service, config.server.max_body_bytes);
    let bind_addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!(addr = %bind_addr, "kinsightd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("kinsightd shutting down");
        })
        .await?;

    Ok(())
}
