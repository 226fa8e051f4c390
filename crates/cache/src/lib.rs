//! Memory-aware LRU caching of loaded generation resources.
//!
//! - [`ResourceCache`] -- LRU map for one resource class with admission
//!   control against the device's current memory reading.
//! - [`CacheManager`] -- the model, VAE and LoRA caches behind one facade,
//!   plus stats and caching-strategy suggestions.
//! - [`memory`] -- device probing (NVML, then host memory) and the
//!   garbage/accelerator-cache hooks run on release.
//! - [`release`] -- per-class strategies for moving a resource off the
//!   device before the cache drops it.

pub mod cache;
pub mod config;
pub mod manager;
pub mod memory;
pub mod release;

pub use cache::{ResourceCache, ResourceClass};
pub use config::CacheConfig;
pub use manager::{CacheManager, CacheStats};
pub use memory::{DeviceError, DeviceMemory, FixedMemoryProbe, MemoryReading, SystemMemoryProbe};
pub use release::{KeepInPlace, ReleaseError, ReleaseStrategy};
