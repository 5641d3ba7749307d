//! Cross-context construction of the registry.
//!
//! The backing store is acquired on the I/O runtime (context A), where the
//! capability flags are derived as well. The registry and its sources are
//! then built on the owner runtime (context B) and handed to the caller's
//! completion callback.

use crate::error::{RegistryError, Result};
use crate::interfaces::{CatalogObserver, CertificateStore, StoreAcquisition, StoreLoader};
use crate::registry::{Registry, RegistryParams};
use crate::service::RegistryHandle;
use crate::types::CapabilityFlags;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub struct RegistryBuilder {
    loader: Arc<dyn StoreLoader>,
    params: RegistryParams,
    observer: Arc<dyn CatalogObserver>,
    io: Handle,
    owner: Handle,
}

impl RegistryBuilder {
    pub fn new(
        loader: Arc<dyn StoreLoader>,
        params: RegistryParams,
        observer: Arc<dyn CatalogObserver>,
        io: Handle,
        owner: Handle,
    ) -> Self {
        Self {
            loader,
            params,
            observer,
            io,
            owner,
        }
    }

    /// Use the current runtime as both contexts
    pub fn on_current_runtime(
        loader: Arc<dyn StoreLoader>,
        params: RegistryParams,
        observer: Arc<dyn CatalogObserver>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| RegistryError::Internal(format!("No Tokio runtime: {}", e)))?;
        Ok(Self::new(loader, params, observer, runtime.clone(), runtime))
    }

    pub fn io_runtime(mut self, io: Handle) -> Self {
        self.io = io;
        self
    }

    pub fn owner_runtime(mut self, owner: Handle) -> Self {
        self.owner = owner;
        self
    }

    /// Start construction and return immediately; `callback` runs on the
    /// owner runtime with the finished registry.
    pub fn create<F>(self, callback: F)
    where
        F: FnOnce(Registry) + Send + 'static,
    {
        let Self {
            loader,
            params,
            observer,
            io,
            owner,
        } = self;

        io.spawn(async move {
            let store = acquire_store(Arc::clone(&loader)).await;
            let capabilities = probe_capabilities(loader, store.clone()).await;
            debug!(?capabilities, "Store phase finished, handing over to owner context");

            // Built on the owner runtime, so asynchronous listing runs there too
            owner.spawn(async move {
                let registry = Registry::new(params, observer, store, capabilities);
                callback(registry);
            });
        });
    }

    /// [`RegistryBuilder::create`], awaiting the registry
    pub async fn build(self) -> Result<Registry> {
        let (tx, rx) = oneshot::channel();
        self.create(move |registry| {
            let _ = tx.send(registry);
        });
        rx.await.map_err(|_| {
            RegistryError::ConstructionAborted("construction task ended before completing".to_string())
        })
    }

    /// Build the registry and run it on the owner runtime behind a handle
    pub async fn spawn(self, buffer: usize) -> Result<RegistryHandle> {
        let owner = self.owner.clone();
        let registry = self.build().await?;
        Ok(RegistryHandle::spawn_on(registry, buffer, &owner))
    }
}

/// Free-function form of [`RegistryBuilder::create`]
pub fn create_registry<F>(
    loader: Arc<dyn StoreLoader>,
    params: RegistryParams,
    observer: Arc<dyn CatalogObserver>,
    io: Handle,
    owner: Handle,
    callback: F,
) where
    F: FnOnce(Registry) + Send + 'static,
{
    RegistryBuilder::new(loader, params, observer, io, owner).create(callback);
}

// ============================================================================
// CONTEXT A
// ============================================================================

async fn acquire_store(loader: Arc<dyn StoreLoader>) -> Option<Arc<dyn CertificateStore>> {
    let acquisition = match tokio::task::spawn_blocking(move || loader.acquire_store()).await {
        Ok(acquisition) => acquisition,
        Err(e) => StoreAcquisition::Unavailable(format!("store loader failed: {}", e)),
    };

    match acquisition {
        StoreAcquisition::Ready(store) => {
            debug!("Certificate store already open");
            Some(store)
        }
        StoreAcquisition::Pending(ready) => {
            debug!("Waiting for certificate store to open");
            match ready.await {
                Ok(store) => Some(store),
                Err(_) => {
                    warn!("Certificate store failed to open, continuing without platform certificates");
                    None
                }
            }
        }
        StoreAcquisition::Unavailable(reason) => {
            warn!(%reason, "Certificate store unavailable, continuing without platform certificates");
            None
        }
    }
}

async fn probe_capabilities(
    loader: Arc<dyn StoreLoader>,
    store: Option<Arc<dyn CertificateStore>>,
) -> CapabilityFlags {
    let probe = tokio::task::spawn_blocking(move || {
        let Some(store) = store else {
            return CapabilityFlags::default();
        };
        CapabilityFlags {
            user_db_available: store.has_public_slot(),
            hardware_token_available: loader.hardware_token_available(),
        }
    })
    .await;

    match probe {
        Ok(capabilities) => {
            info!(
                user_db_available = capabilities.user_db_available,
                hardware_token_available = capabilities.hardware_token_available,
                "Capabilities probed"
            );
            capabilities
        }
        Err(e) => {
            warn!(error = %e, "Capability probe failed");
            CapabilityFlags::default()
        }
    }
}
