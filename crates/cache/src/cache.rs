//! LRU cache for one class of loaded resources.
//!
//! Recency is the insertion order of an [`IndexMap`]: the first entry is the
//! least recently used, the last entry the most recently used. Every
//! admission consults the device's current memory reading; a refusal is not
//! an error, it tells the caller to proceed without caching.
//!
//! The map lock is held only while the map is mutated. Release side effects
//! (offloading, garbage pass, accelerator cache clear) run after the lock is
//! dropped, since they may block on device synchronization.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::CacheConfig;
use crate::memory::{reclaim, DeviceMemory, MemoryReading};
use crate::release::{release_best_effort, KeepInPlace, ReleaseStrategy};

/// The three kinds of cached resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// Primary generative model (checkpoint).
    Model,
    /// Auxiliary decoder.
    Vae,
    /// Lightweight adapter.
    Lora,
}

impl ResourceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceClass::Model => "model",
            ResourceClass::Vae => "vae",
            ResourceClass::Lora => "lora",
        }
    }

    /// This class's size estimate from `config`.
    pub fn size_estimate(self, config: &CacheConfig) -> u64 {
        match self {
            ResourceClass::Model => config.model_size_bytes,
            ResourceClass::Vae => config.vae_size_bytes,
            ResourceClass::Lora => config.lora_size_bytes,
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory-aware LRU cache of shared resource handles.
pub struct ResourceCache<H> {
    class: ResourceClass,
    capacity: usize,
    size_estimate: u64,
    memory_threshold: f64,
    device: Arc<dyn DeviceMemory>,
    release: Box<dyn ReleaseStrategy<H>>,
    entries: Mutex<IndexMap<String, Arc<H>>>,
}

impl<H> ResourceCache<H>
where
    H: Send + Sync + 'static,
{
    /// Create an empty cache for `class`. Resources are released in place
    /// until a strategy is installed with
    /// [`set_release_strategy`](Self::set_release_strategy).
    pub fn new(class: ResourceClass, config: &CacheConfig, device: Arc<dyn DeviceMemory>) -> Self {
        Self {
            class,
            capacity: config.capacity,
            size_estimate: class.size_estimate(config),
            memory_threshold: config.memory_threshold,
            device,
            release: Box::new(KeepInPlace),
            entries: Mutex::new(IndexMap::with_capacity(config.capacity)),
        }
    }

    pub fn set_release_strategy(&mut self, strategy: impl ReleaseStrategy<H> + 'static) {
        self.release = Box::new(strategy);
    }

    pub fn class(&self) -> ResourceClass {
        self.class
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size_estimate(&self) -> u64 {
        self.size_estimate
    }

    pub fn probe_memory(&self) -> MemoryReading {
        self.device.probe()
    }

    /// Whether caching `estimated_size` more bytes is currently safe.
    ///
    /// Advisory only: nothing is reserved.
    pub fn admit(&self, estimated_size: u64) -> bool {
        self.probe_memory()
            .admits(estimated_size, self.memory_threshold)
    }

    /// Cache `handle` under `name` as the most recently used entry.
    ///
    /// Returns `false` without touching the cache if memory pressure refuses
    /// the admission. At capacity, the least recently used entry is evicted
    /// first. Re-caching an existing name replaces its handle.
    pub fn put(&self, name: impl Into<String>, handle: Arc<H>) -> bool {
        let name = name.into();
        if !self.admit(self.size_estimate) {
            tracing::debug!(
                class = %self.class,
                name = %name,
                size_estimate = self.size_estimate,
                "Cache admission refused under memory pressure",
            );
            return false;
        }

        let mut displaced = Vec::new();
        {
            let mut entries = self.entries.lock();
            if let Some(previous) = entries.shift_remove(&name) {
                if !Arc::ptr_eq(&previous, &handle) {
                    displaced.push((name.clone(), previous));
                }
            } else if entries.len() >= self.capacity {
                if let Some(evicted) = entries.shift_remove_index(0) {
                    displaced.push(evicted);
                }
            }
            entries.insert(name.clone(), handle);
        }

        for (evicted_name, evicted) in displaced {
            tracing::info!(class = %self.class, name = %evicted_name, "Evicting cached resource");
            self.dispose(&evicted_name, evicted);
            reclaim(self.device.as_ref());
        }

        tracing::debug!(class = %self.class, name = %name, "Resource cached");
        true
    }

    /// Look up `name`, marking it most recently used on a hit.
    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        let mut entries = self.entries.lock();
        let handle = entries.shift_remove(name)?;
        entries.insert(name.to_string(), Arc::clone(&handle));
        Some(handle)
    }

    /// Whether `name` is cached, without affecting recency.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    /// Remove `name` and release it. Returns whether it was cached.
    pub fn release(&self, name: &str) -> bool {
        let removed = self.entries.lock().shift_remove(name);
        match removed {
            Some(handle) => {
                tracing::info!(class = %self.class, name, "Releasing cached resource");
                self.dispose(name, handle);
                reclaim(self.device.as_ref());
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Cached names from least to most recently used.
    pub fn names(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Remove and release every entry without a garbage pass.
    ///
    /// Returns the number of entries released. The caller is responsible
    /// for the final [`reclaim`].
    pub(crate) fn release_all_deferred(&self) -> usize {
        let drained: Vec<(String, Arc<H>)> = self.entries.lock().drain(..).collect();
        let count = drained.len();
        for (name, handle) in drained {
            self.dispose(&name, handle);
        }
        count
    }

    /// Offload via the class strategy, then drop the cache's reference.
    fn dispose(&self, name: &str, handle: Arc<H>) {
        release_best_effort(self.release.as_ref(), self.class.as_str(), name, &handle);
        drop(handle);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
