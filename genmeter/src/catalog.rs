//! Shared, hot-swappable snapshot of the model definitions.
//!
//! The worker matches every generation against the catalog, so lookups must not touch storage.
//! [`CatalogHandle`] holds a compiled [`ModelCatalog`] behind an [`ArcSwap`]: readers grab the
//! current snapshot without locking, and a refresh builds a new snapshot and swaps it in.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::db::errors::Result;
use crate::db::handlers::model_definitions::ModelDefinitionFilter;
use crate::storage::Storage;
use crate::usage::ModelCatalog;

#[derive(Clone)]
pub struct CatalogHandle {
    current: Arc<ArcSwap<ModelCatalog>>,
    storage: Arc<dyn Storage>,
}

impl CatalogHandle {
    /// Build a handle and load the first snapshot.
    pub async fn load(storage: Arc<dyn Storage>) -> Result<Self> {
        let handle = Self {
            current: Arc::new(ArcSwap::from_pointee(ModelCatalog::default())),
            storage,
        };
        handle.refresh().await?;
        Ok(handle)
    }

    /// The current snapshot. It stays valid even if a refresh happens while it is in use.
    pub fn snapshot(&self) -> Arc<ModelCatalog> {
        self.current.load_full()
    }

    /// Reload every definition from storage and swap in a new snapshot.
    #[instrument(skip(self), err)]
    pub async fn refresh(&self) -> Result<()> {
        let definitions = self
            .storage
            .list_model_definitions(&ModelDefinitionFilter::all())
            .await?;
        let catalog = ModelCatalog::compile(definitions);
        debug!(definitions = catalog.len(), "Model catalog refreshed");
        self.current.store(Arc::new(catalog));
        Ok(())
    }

    /// Refresh periodically until cancelled. Picks up definitions changed by other processes.
    pub async fn run_refresh(self, interval: Duration, shutdown: CancellationToken) {
        info!(interval = ?interval, "Starting model catalog refresh task");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately and the catalog was just loaded
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Model catalog refresh task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        error!("Failed to refresh model catalog: {}", e);
                    }
                }
            }
        }
    }
}
