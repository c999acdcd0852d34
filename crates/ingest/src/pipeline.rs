//! Process-wide context: every service built once and shared by handle.

use std::sync::Arc;

use eyre::WrapErr;
use padwatch_chain::{AlloySource, ChainSource, ContractAbis, address};
use padwatch_core::Settings;
use padwatch_storage::{BlobStore, CacheConfig, EventCache, FileBlobStore, PgBlobStore};

use crate::discovery::{DiscoveryConfig, DiscoveryCoordinator};
use crate::listing::{ListConfig, PairListService};
use crate::registry::{RegistryConfig, SubscriptionRegistry};

#[derive(Clone)]
pub struct Pipeline {
    pub settings: Arc<Settings>,
    pub source: Arc<dyn ChainSource>,
    pub store: Arc<dyn BlobStore>,
    pub cache: Arc<EventCache>,
    pub registry: Arc<SubscriptionRegistry>,
    pub discovery: Arc<DiscoveryCoordinator>,
    pub listing: Arc<PairListService>,
}

impl Pipeline {
    /// Connect to the chain and the configured blob store, then wire every service.
    pub async fn connect(settings: Settings) -> eyre::Result<Self> {
        let abis = ContractAbis::load(
            settings.factory_abi_path.as_deref(),
            settings.token_abi_path.as_deref(),
            settings.presale_abi_path.as_deref(),
        )
        .wrap_err("Failed to load contract ABIs")?;

        let source = AlloySource::connect(&settings.rpc_url, settings.ws_url.clone(), &abis)
            .wrap_err("Failed to create chain client")?;
        tracing::info!(
            rpc = %settings.rpc_url,
            push = settings.ws_url.is_some(),
            "Chain client ready"
        );

        let store: Arc<dyn BlobStore> = match settings.database_url.as_deref() {
            Some(url) => {
                let pool = padwatch_storage::connect(url)
                    .await
                    .wrap_err("Failed to connect to database")?;
                let store = PgBlobStore::new(pool, settings.max_blob_bytes);
                store.ensure_schema().await?;
                tracing::info!("Event snapshots stored in PostgreSQL");
                Arc::new(store)
            }
            None => {
                tracing::info!(path = %settings.cache_path.display(), "Event snapshots stored on disk");
                Arc::new(FileBlobStore::new(settings.cache_path.clone(), settings.max_blob_bytes))
            }
        };

        Self::with_parts(settings, Arc::new(source), store, &abis)
    }

    /// Wire the services around an existing chain source and blob store.
    pub fn with_parts(
        settings: Settings,
        source: Arc<dyn ChainSource>,
        store: Arc<dyn BlobStore>,
        abis: &ContractAbis,
    ) -> eyre::Result<Self> {
        let factory = address::parse_address(&settings.factory_address)
            .wrap_err_with(|| format!("Invalid FACTORY_ADDRESS `{}`", settings.factory_address))?;

        let cache = Arc::new(EventCache::new(CacheConfig::from_settings(&settings)));
        let registry = Arc::new(SubscriptionRegistry::new(
            source.clone(),
            RegistryConfig::from_settings(&settings),
        ));
        let discovery = Arc::new(DiscoveryCoordinator::new(
            source.clone(),
            registry.clone(),
            cache.clone(),
            store.clone(),
            abis,
            DiscoveryConfig::from_settings(&settings),
        )?);
        let listing = Arc::new(PairListService::new(
            source.clone(),
            factory,
            ListConfig::from_settings(&settings),
        ));

        Ok(Self {
            settings: Arc::new(settings),
            source,
            store,
            cache,
            registry,
            discovery,
            listing,
        })
    }

    pub async fn start(&self) -> eyre::Result<()> {
        self.discovery.start().await?;
        Ok(())
    }

    /// Stop ingestion and flush the cache. Safe to call more than once.
    pub async fn shutdown(&self) -> eyre::Result<()> {
        self.discovery.stop().await?;
        Ok(())
    }
}
