//! Backend name to adapter resolution, and the single active adapter

use std::sync::Arc;
use log::{debug, error, info};
use tokio::sync::Mutex;

use crate::config::{GatewayConfig, ProviderConfig};
use crate::envelope::LoadParams;
use crate::error::ErrorKind;
use crate::providers::SharedProvider;

/// Builds a fresh, uninitialized adapter
pub type ProviderFactory
  = Box<dyn Fn(&ProviderConfig) -> SharedProvider + Send + Sync>;

/// The adapter currently loaded, with its name.
///
/// Only [`Registry::load_provider`] and [`Registry::unload`] write it.
/// Readers clone the adapter out and never hold the lock across a backend
/// call.
#[derive(Default)]
pub struct ActiveProvider
{   slot: Mutex<Option<(String, SharedProvider)>>
}

impl ActiveProvider
{   pub fn new() -> Self
    {   ActiveProvider::default()
    }

    pub async fn adapter(&self) -> Option<SharedProvider>
    {   self.slot.lock().await.as_ref().map(|(_, adapter)| adapter.clone())
    }

    pub async fn name(&self) -> Option<String>
    {   self.slot.lock().await.as_ref().map(|(name, _)| name.clone())
    }

    pub async fn is_loaded(&self) -> bool
    {   self.slot.lock().await.is_some()
    }
}

/// Identifier to factory table
pub struct Registry
{   config: GatewayConfig
  , factories: Vec<(String, ProviderFactory)>
  , loading: Mutex<()>
}

impl Registry
{   /// Empty registry, backends are added with [`Registry::register`]
    pub fn new(config: GatewayConfig) -> Self
    {   Registry
        {   config
          , factories: vec![]
          , loading: Mutex::new(())
        }
    }

    /// Registry holding every backend shipped with the gateway
    pub fn with_builtin(config: GatewayConfig) -> Self
    {   let mut registry = Registry::new(config);
        registry.register(
          crate::providers::openai::NAME,
          |config| Arc::new(crate::providers::openai::new(config))
        );
        registry.register(
          crate::providers::novelai::NAME,
          |config| Arc::new(crate::providers::novelai::NovelAiProvider::new(config))
        );
        registry.register(
          crate::providers::groq::NAME,
          |config| Arc::new(crate::providers::groq::new(config))
        );
        registry.register(
          crate::providers::mistral::NAME,
          |config| Arc::new(crate::providers::mistral::new(config))
        );
        registry
    }

    /// Add or replace a backend
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
      F: Fn(&ProviderConfig) -> SharedProvider + Send + Sync + 'static
    {   debug!("Registering provider: {}", name);
        let factory: ProviderFactory = Box::new(factory);
        match self.factories.iter_mut().find(|(n, _)| n == name)
        {   Some(existing) => existing.1 = factory
          , None => self.factories.push((name.to_string(), factory))
        }
    }

    pub fn provider_names(&self) -> Vec<String>
    {   self.factories
          .iter()
          .map(|(name, _)| name.clone())
          .collect()
    }

    fn create(&self, name: &str) -> Option<SharedProvider>
    {   self.factories
          .iter()
          .find(|(n, _)| n == name)
          .map(|(n, factory)| factory(&self.config.provider(n)))
    }

    /// Resolve, free the previous adapter, init the new one and install it.
    ///
    /// Loads run one at a time. The slot is empty while the new adapter
    /// initializes, and stays empty on any failure.
    pub async fn load_provider(
      &self
    , active: &ActiveProvider
    , name: &str
    , params: &LoadParams
    ) -> ErrorKind
    {   let _loading = self.loading.lock().await;
        let Some(adapter) = self.create(name) else
        {   error!(
              "Unknown provider \"{}\", valid providers are: {}",
              name,
              self.provider_names().join(", ")
            );
            self.unload(active).await;
            return ErrorKind::InvalidProvider;
        };

        self.unload(active).await;

        let outcome = adapter.init(params).await;
        if outcome.is_error()
        {   error!("Failed to load provider {}: {}", name, outcome);
            adapter.free().await;
            return outcome;
        }

        info!("Successfully loaded provider: {}", name);
        *active.slot.lock().await = Some((name.to_string(), adapter));
        ErrorKind::Success
    }

    /// Free and forget the active adapter, if any
    pub async fn unload(&self, active: &ActiveProvider)
    {   let taken = active.slot.lock().await.take();
        if let Some((name, adapter)) = taken
        {   debug!("Freeing provider: {}", name);
            adapter.free().await;
        }
    }
}

impl std::fmt::Debug for Registry
{   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {   f.debug_struct("Registry")
          .field("providers", &self.provider_names())
          .finish()
    }
}
