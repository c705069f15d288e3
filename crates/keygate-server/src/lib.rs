//! Process bootstrap for the Keygate token engine.
//!
//! Selects the store backend once, builds the [`TokenService`] and owns the
//! background tasks (signing-key populator, memory sweeper) until shutdown.

pub mod config;
pub mod observability;

use std::sync::Arc;

use anyhow::Context;
use keygate_auth::storage::MemoryStore;
use keygate_auth::{IdentityProvider, PopulatorHandle, SharedStore, TokenService};
use keygate_auth_redis::{RedisStore, RedisStoreConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use config::{LoggingConfig, PopulatorConfig, ServerConfig, StoreBackend, StoreConfig};
pub use observability::{apply_logging_level, init_tracing, init_tracing_with_level};

/// The selected store plus its maintenance task, if any.
pub struct StoreHandle {
    pub store: SharedStore,
    sweeper: Option<JoinHandle<()>>,
}

/// Creates the configured store.
///
/// The memory backend gets a sweeper that stops with `cancel`.
pub async fn create_store(
    config: &StoreConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<StoreHandle> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::info!("using in-memory store");
            let store = Arc::new(MemoryStore::new());
            let sweeper = store
                .clone()
                .start_sweeper(config.sweep_interval, cancel.child_token());
            Ok(StoreHandle {
                store,
                sweeper: Some(sweeper),
            })
        }
        StoreBackend::Redis => {
            let redis_config = RedisStoreConfig {
                url: config.url.clone(),
                pool_size: config.pool_size,
                timeout: config.timeout,
            };
            let store = RedisStore::connect(&redis_config)
                .await
                .context("failed to connect to Redis")?;
            Ok(StoreHandle {
                store: Arc::new(store),
                sweeper: None,
            })
        }
    }
}

/// Running token engine.
pub struct Engine {
    service: Arc<TokenService>,
    populator: Option<PopulatorHandle>,
    sweeper: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Engine {
    /// Builds the store and service and starts background tasks.
    pub async fn start(
        config: &ServerConfig,
        identity: Arc<dyn IdentityProvider>,
    ) -> anyhow::Result<Self> {
        let cancel = CancellationToken::new();
        let StoreHandle { store, sweeper } = create_store(&config.store, &cancel).await?;

        let service = Arc::new(
            TokenService::new(&config.tokens, store, identity)
                .context("failed to build token service")?,
        );

        let populator = if config.populator.enabled {
            let handle = service
                .key_manager()
                .start_populator(cancel.child_token())
                .context("failed to start signing-key populator")?;
            Some(handle)
        } else {
            tracing::info!("signing-key populator disabled for this process");
            None
        };

        Ok(Self {
            service,
            populator,
            sweeper,
            cancel,
        })
    }

    pub fn service(&self) -> Arc<TokenService> {
        self.service.clone()
    }

    /// Stops background tasks and waits for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Some(populator) = self.populator {
            populator.shutdown().await;
        }
        if let Some(sweeper) = self.sweeper {
            if let Err(e) = sweeper.await {
                tracing::warn!(error = %e, "store sweeper ended abnormally");
            }
        }
        tracing::info!("token engine stopped");
    }
}
