use xyzgrid_core::load_order::{
    SizeEstimates, DEFAULT_LORA_SIZE_BYTES, DEFAULT_MODEL_SIZE_BYTES, DEFAULT_VAE_SIZE_BYTES,
};
use xyzgrid_core::CoreError;

/// Default number of entries held per resource class.
pub const DEFAULT_CAPACITY: usize = 3;

/// Default fraction of device memory that may be in use after an admission.
pub const DEFAULT_MEMORY_THRESHOLD: f64 = 0.85;

/// Resource cache configuration.
///
/// The capacity and threshold are shared by all three resource classes;
/// the size estimates are per class.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    pub memory_threshold: f64,
    pub model_size_bytes: u64,
    pub vae_size_bytes: u64,
    pub lora_size_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            model_size_bytes: DEFAULT_MODEL_SIZE_BYTES,
            vae_size_bytes: DEFAULT_VAE_SIZE_BYTES,
            lora_size_bytes: DEFAULT_LORA_SIZE_BYTES,
        }
    }
}

impl CacheConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_memory_threshold(mut self, threshold: f64) -> Self {
        self.memory_threshold = threshold;
        self
    }

    /// Validate the configuration.
    ///
    /// Rules:
    /// - `capacity` must be at least 1.
    /// - `memory_threshold` must lie strictly between 0 and 1.
    /// - Every size estimate must be non-zero.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.capacity == 0 {
            return Err(CoreError::Validation(
                "Cache capacity must be at least 1".to_string(),
            ));
        }
        if !(self.memory_threshold > 0.0 && self.memory_threshold < 1.0) {
            return Err(CoreError::Validation(format!(
                "Memory threshold must be between 0 and 1 (exclusive), got {}",
                self.memory_threshold
            )));
        }
        for (class, size) in [
            ("model", self.model_size_bytes),
            ("vae", self.vae_size_bytes),
            ("lora", self.lora_size_bytes),
        ] {
            if size == 0 {
                return Err(CoreError::Validation(format!(
                    "Size estimate for {class} must be non-zero"
                )));
            }
        }
        Ok(())
    }

    pub fn size_estimates(&self) -> SizeEstimates {
        SizeEstimates {
            model_bytes: self.model_size_bytes,
            vae_bytes: self.vae_size_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn default_is_valid() {
        assert_matches!(CacheConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_capacity_rejected() {
        let config = CacheConfig::default().with_capacity(0);
        assert_matches!(config.validate(), Err(CoreError::Validation(_)));
    }

    #[test]
    fn threshold_bounds_are_exclusive() {
        for threshold in [0.0, 1.0, -0.5, 1.5, f64::NAN] {
            let config = CacheConfig::default().with_memory_threshold(threshold);
            assert_matches!(config.validate(), Err(CoreError::Validation(_)));
        }
    }

    #[test]
    fn zero_size_estimate_rejected() {
        let config = CacheConfig {
            vae_size_bytes: 0,
            ..CacheConfig::default()
        };
        assert_matches!(config.validate(), Err(CoreError::Validation(msg)) if msg.contains("vae"));
    }
}
