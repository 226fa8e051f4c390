//! Cache manager over the three resource classes.
//!
//! [`CacheManager`] owns one [`ResourceCache`] per class (model, VAE, LoRA),
//! all sharing the same device and capacity. The generation pipeline calls
//! `cache_*` after loading a resource, `get_*` before loading one, and
//! `uncache_*` when it wants the memory back. Handles are opaque: the
//! manager never looks inside them.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use xyzgrid_core::load_order::{suggest_strategy, CachingStrategy};
use xyzgrid_core::CoreError;

use crate::cache::{ResourceCache, ResourceClass};
use crate::config::CacheConfig;
use crate::memory::{reclaim, DeviceMemory, MemoryReading};
use crate::release::ReleaseStrategy;

/// Point-in-time view of the cache and device memory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub models_cached: usize,
    pub vaes_cached: usize,
    pub loras_cached: usize,
    pub memory_free: u64,
    pub memory_total: u64,
    /// Fraction of device memory in use; 0 when the total is unknown.
    pub memory_usage: f64,
    pub cached_models: Vec<String>,
    pub cached_vaes: Vec<String>,
    pub cached_loras: Vec<String>,
}

/// LRU caches for models (`M`), VAEs (`V`) and LoRAs (`L`).
pub struct CacheManager<M, V, L> {
    config: CacheConfig,
    device: Arc<dyn DeviceMemory>,
    models: ResourceCache<M>,
    vaes: ResourceCache<V>,
    loras: ResourceCache<L>,
}

impl<M, V, L> CacheManager<M, V, L>
where
    M: Send + Sync + 'static,
    V: Send + Sync + 'static,
    L: Send + Sync + 'static,
{
    /// Create a manager with empty caches. Fails if `config` is invalid.
    pub fn new(config: CacheConfig, device: Arc<dyn DeviceMemory>) -> Result<Self, CoreError> {
        config.validate()?;
        tracing::info!(
            capacity = config.capacity,
            memory_threshold = config.memory_threshold,
            accelerator = device.is_accelerator(),
            "Resource cache manager created",
        );
        Ok(Self {
            models: ResourceCache::new(ResourceClass::Model, &config, Arc::clone(&device)),
            vaes: ResourceCache::new(ResourceClass::Vae, &config, Arc::clone(&device)),
            loras: ResourceCache::new(ResourceClass::Lora, &config, Arc::clone(&device)),
            config,
            device,
        })
    }

    /// Install the strategy used to offload models when they are released.
    pub fn with_model_release(mut self, strategy: impl ReleaseStrategy<M> + 'static) -> Self {
        self.models.set_release_strategy(strategy);
        self
    }

    pub fn with_vae_release(mut self, strategy: impl ReleaseStrategy<V> + 'static) -> Self {
        self.vaes.set_release_strategy(strategy);
        self
    }

    pub fn with_lora_release(mut self, strategy: impl ReleaseStrategy<L> + 'static) -> Self {
        self.loras.set_release_strategy(strategy);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn models(&self) -> &ResourceCache<M> {
        &self.models
    }

    pub fn vaes(&self) -> &ResourceCache<V> {
        &self.vaes
    }

    pub fn loras(&self) -> &ResourceCache<L> {
        &self.loras
    }

    pub fn probe_memory(&self) -> MemoryReading {
        self.device.probe()
    }

    /// Whether caching `estimated_size` more bytes is currently safe.
    pub fn admit(&self, estimated_size: u64) -> bool {
        self.probe_memory()
            .admits(estimated_size, self.config.memory_threshold)
    }

    // -- models --

    pub fn cache_model(&self, name: impl Into<String>, handle: Arc<M>) -> bool {
        self.models.put(name, handle)
    }

    pub fn get_model(&self, name: &str) -> Option<Arc<M>> {
        self.models.get(name)
    }

    pub fn uncache_model(&self, name: &str) -> bool {
        self.models.release(name)
    }

    // -- VAEs --

    pub fn cache_vae(&self, name: impl Into<String>, handle: Arc<V>) -> bool {
        self.vaes.put(name, handle)
    }

    pub fn get_vae(&self, name: &str) -> Option<Arc<V>> {
        self.vaes.get(name)
    }

    pub fn uncache_vae(&self, name: &str) -> bool {
        self.vaes.release(name)
    }

    // -- LoRAs --

    pub fn cache_lora(&self, name: impl Into<String>, handle: Arc<L>) -> bool {
        self.loras.put(name, handle)
    }

    pub fn get_lora(&self, name: &str) -> Option<Arc<L>> {
        self.loras.get(name)
    }

    pub fn uncache_lora(&self, name: &str) -> bool {
        self.loras.release(name)
    }

    /// Release every cached resource of every class.
    ///
    /// Each entry goes through its class's release strategy; the garbage
    /// pass and accelerator cache clear run once at the end, not per entry.
    /// Returns the number of entries released.
    pub fn clear_all(&self) -> usize {
        let released = self.models.release_all_deferred()
            + self.vaes.release_all_deferred()
            + self.loras.release_all_deferred();
        reclaim(self.device.as_ref());
        tracing::info!(released, "Cleared all cached resources");
        released
    }

    pub fn stats(&self) -> CacheStats {
        let memory = self.probe_memory();
        let cached_models = self.models.names();
        let cached_vaes = self.vaes.names();
        let cached_loras = self.loras.names();
        CacheStats {
            models_cached: cached_models.len(),
            vaes_cached: cached_vaes.len(),
            loras_cached: cached_loras.len(),
            memory_free: memory.free,
            memory_total: memory.total,
            memory_usage: memory.usage_fraction(),
            cached_models,
            cached_vaes,
            cached_loras,
        }
    }

    /// Recommend a caching strategy and model load order for a batch that
    /// will use `model_ids` and `vae_ids`, based on current free memory.
    pub fn suggest_strategy<S: AsRef<str>>(
        &self,
        model_ids: &[S],
        vae_ids: &[S],
    ) -> CachingStrategy {
        let memory = self.probe_memory();
        let strategy = suggest_strategy(
            model_ids,
            vae_ids,
            memory.free,
            self.config.size_estimates(),
        );
        tracing::debug!(
            memory_free = memory.free,
            estimated_bytes = strategy.estimated_bytes,
            memory_sufficient = strategy.memory_sufficient,
            "Caching strategy suggested",
        );
        strategy
    }
}

impl<M, V, L> fmt::Debug for CacheManager<M, V, L>
where
    M: Send + Sync + 'static,
    V: Send + Sync + 'static,
    L: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .field("models", &self.models.names())
            .field("vaes", &self.vaes.names())
            .field("loras", &self.loras.names())
            .finish_non_exhaustive()
    }
}
