//! Device memory probing and reclamation hooks.
//!
//! [`SystemMemoryProbe`] reads GPU 0 through NVML when NVIDIA drivers are
//! present and falls back to host memory via `sysinfo` otherwise. NVML
//! initialisation is **gracefully optional**: a host without drivers logs a
//! warning and probes host memory instead of failing.

use std::sync::atomic::{AtomicU64, Ordering};

use nvml_wrapper::Nvml;
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::System;

/// Free and total memory of the active compute device, in bytes.
///
/// A `total` of 0 means the device could not be queried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryReading {
    pub free: u64,
    pub total: u64,
}

impl MemoryReading {
    pub const UNKNOWN: MemoryReading = MemoryReading { free: 0, total: 0 };

    pub fn new(free: u64, total: u64) -> Self {
        Self { free, total }
    }

    pub fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }

    /// Fraction of memory in use, or 0 when the total is unknown.
    pub fn usage_fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used() as f64 / self.total as f64
    }

    /// Whether `size` more bytes would keep usage strictly below
    /// `threshold`. Always `false` when the total is unknown.
    pub fn admits(&self, size: u64, threshold: f64) -> bool {
        if self.total == 0 {
            return false;
        }
        let projected = self.used().saturating_add(size) as f64 / self.total as f64;
        projected < threshold
    }
}

/// Errors from device-level cleanup.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Failed to clear accelerator cache: {0}")]
    CacheClear(String),

    #[error("Device synchronization failed: {0}")]
    Sync(String),
}

/// The compute device the cached resources live on.
///
/// Probing must never fail; unreadable devices report
/// [`MemoryReading::UNKNOWN`]. Cleanup hooks default to no-ops.
pub trait DeviceMemory: Send + Sync {
    fn probe(&self) -> MemoryReading;

    /// Whether the device is an accelerator with its own allocator cache.
    fn is_accelerator(&self) -> bool {
        false
    }

    /// Ask the host runtime to reclaim memory of dropped resources.
    fn collect_garbage(&self) {}

    /// Return cached-but-unused accelerator blocks to the driver.
    fn empty_accelerator_cache(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Run the garbage pass and, on accelerators, the cache clear.
///
/// Failures are logged and swallowed.
pub fn reclaim(device: &dyn DeviceMemory) {
    device.collect_garbage();
    if device.is_accelerator() {
        if let Err(e) = device.empty_accelerator_cache() {
            tracing::warn!(error = %e, "Accelerator cache clear failed, continuing");
        }
    }
}

// ---------------------------------------------------------------------------
// SystemMemoryProbe
// ---------------------------------------------------------------------------

type GarbageHook = Box<dyn Fn() + Send + Sync>;
type CacheClearHook = Box<dyn Fn() -> Result<(), DeviceError> + Send + Sync>;

/// Probes GPU 0 via NVML, else host memory via `sysinfo`.
///
/// NVML can read memory but cannot free it. The garbage pass and the
/// accelerator cache clear belong to the host's compute runtime, so both
/// are no-ops until the host installs them with
/// [`with_garbage_collector`](Self::with_garbage_collector) and
/// [`with_accelerator_cache_clear`](Self::with_accelerator_cache_clear).
pub struct SystemMemoryProbe {
    /// `None` when NVML could not be initialised (no drivers / no GPU).
    nvml: Option<Nvml>,
    system: Mutex<System>,
    garbage_hook: Option<GarbageHook>,
    cache_clear_hook: Option<CacheClearHook>,
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        let nvml = match Nvml::init() {
            Ok(nvml) => match nvml.device_count() {
                Ok(count) if count > 0 => {
                    tracing::info!(gpu_count = count, "NVML initialised, probing GPU memory");
                    Some(nvml)
                }
                Ok(_) => {
                    tracing::info!("NVML reports no GPUs, probing host memory");
                    None
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to query GPU count, probing host memory");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "NVML unavailable, probing host memory");
                None
            }
        };
        Self {
            nvml,
            system: Mutex::new(System::new()),
            garbage_hook: None,
            cache_clear_hook: None,
        }
    }

    /// Run `hook` as the garbage pass after a resource is released.
    pub fn with_garbage_collector(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.garbage_hook = Some(Box::new(hook));
        self
    }

    /// Run `hook` to return cached accelerator blocks to the driver.
    ///
    /// Only called while NVML reports a GPU.
    pub fn with_accelerator_cache_clear(
        mut self,
        hook: impl Fn() -> Result<(), DeviceError> + Send + Sync + 'static,
    ) -> Self {
        self.cache_clear_hook = Some(Box::new(hook));
        self
    }

    fn probe_gpu(&self, nvml: &Nvml) -> Result<MemoryReading, nvml_wrapper::error::NvmlError> {
        let info = nvml.device_by_index(0)?.memory_info()?;
        Ok(MemoryReading::new(info.free, info.total))
    }

    fn probe_host(&self) -> MemoryReading {
        let mut sys = self.system.lock();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return MemoryReading::UNKNOWN;
        }
        MemoryReading::new(sys.available_memory(), total)
    }
}

impl DeviceMemory for SystemMemoryProbe {
    fn probe(&self) -> MemoryReading {
        if let Some(nvml) = self.nvml.as_ref() {
            match self.probe_gpu(nvml) {
                Ok(reading) => return reading,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "GPU memory query failed, falling back to host memory",
                    );
                }
            }
        }
        self.probe_host()
    }

    fn is_accelerator(&self) -> bool {
        self.nvml.is_some()
    }

    fn collect_garbage(&self) {
        if let Some(hook) = self.garbage_hook.as_ref() {
            hook();
        }
    }

    fn empty_accelerator_cache(&self) -> Result<(), DeviceError> {
        match self.cache_clear_hook.as_ref() {
            Some(hook) => hook(),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// FixedMemoryProbe
// ---------------------------------------------------------------------------

/// A device with an externally managed memory reading.
///
/// For hosts that budget memory themselves; the reading can be adjusted at
/// any time with [`FixedMemoryProbe::set`].
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    free: AtomicU64,
    total: AtomicU64,
}

impl FixedMemoryProbe {
    pub fn new(free: u64, total: u64) -> Self {
        Self {
            free: AtomicU64::new(free),
            total: AtomicU64::new(total),
        }
    }

    pub fn set(&self, free: u64, total: u64) {
        self.free.store(free, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
    }
}

impl DeviceMemory for FixedMemoryProbe {
    fn probe(&self) -> MemoryReading {
        MemoryReading::new(
            self.free.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
