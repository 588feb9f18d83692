//! Shared application state handed to every axum handler.

use crate::{
    config::AppConfig,
    services::{
        distribution::StorageDistribution,
        offer::FileSystemOffer,
        offer_registry::{OfferRegistry, StaticStrategyProvider},
        offset_store::SqliteOffsetStore,
        staging::FileSystemStaging,
        synchronization::OfferSyncService,
    },
};
use anyhow::{Context, Result};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<OfferRegistry>,
    pub distribution: StorageDistribution,
    pub sync: OfferSyncService,
}

impl AppState {
    /// Open every configured offer and wire the services on top of them.
    pub async fn from_config(cfg: &AppConfig) -> Result<Self> {
        let mut registry = OfferRegistry::new();
        for offer_id in &cfg.offers {
            let path = cfg.offer_path(offer_id);
            let offer = FileSystemOffer::open(offer_id.clone(), &path, cfg.offer_capacity_bytes)
                .await
                .with_context(|| format!("opening offer `{}` at {}", offer_id, path.display()))?;
            registry.register(Arc::new(offer));
        }
        let registry = Arc::new(registry);

        let strategies = Arc::new(StaticStrategyProvider::new([cfg.strategy()]));
        let staging = Arc::new(FileSystemStaging::new(&cfg.workspace_dir));
        let distribution = StorageDistribution::new(
            registry.clone(),
            strategies,
            staging,
            cfg.storage.clone(),
        );

        let offsets = SqliteOffsetStore::connect(&cfg.sync_database_url)
            .await
            .with_context(|| format!("opening sync offsets at {}", cfg.sync_database_url))?;
        let sync = OfferSyncService::new(registry.clone(), Arc::new(offsets), cfg.storage.clone());

        Ok(Self {
            registry,
            distribution,
            sync,
        })
    }
}
