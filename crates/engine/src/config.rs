use std::str::FromStr;

use xyzgrid_cache::CacheConfig;
use xyzgrid_core::types::BYTES_PER_MB;
use xyzgrid_core::CoreError;
use xyzgrid_events::TrackerConfig;

/// Errors raised while loading configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a valid {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error(transparent)]
    Validation(#[from] CoreError),
}

/// Runtime configuration for the grid cache and progress tracker.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub cache: CacheConfig,
    pub tracker: TrackerConfig,
    /// Emit logs as JSON lines instead of human-readable text.
    pub log_json: bool,
}

impl RuntimeConfig {
    /// Load configuration from environment variables (and `.env`) with
    /// defaults.
    ///
    /// | Env Var                | Default |
    /// |------------------------|---------|
    /// | `XYZ_CACHE_CAPACITY`   | `3`     |
    /// | `XYZ_MEMORY_THRESHOLD` | `0.85`  |
    /// | `XYZ_MODEL_SIZE_MB`    | `2048`  |
    /// | `XYZ_VAE_SIZE_MB`      | `500`   |
    /// | `XYZ_LORA_SIZE_MB`     | `200`   |
    /// | `XYZ_HISTORY_LIMIT`    | `10`    |
    /// | `XYZ_PREVIEW_LIMIT`    | `5`     |
    /// | `XYZ_LOG_JSON`         | `false` |
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let cache = CacheConfig {
            capacity: parse_var(
                &lookup,
                "XYZ_CACHE_CAPACITY",
                "positive integer",
                defaults.cache.capacity,
            )?,
            memory_threshold: parse_var(
                &lookup,
                "XYZ_MEMORY_THRESHOLD",
                "fraction",
                defaults.cache.memory_threshold,
            )?,
            model_size_bytes: parse_mb(
                &lookup,
                "XYZ_MODEL_SIZE_MB",
                defaults.cache.model_size_bytes,
            )?,
            vae_size_bytes: parse_mb(&lookup, "XYZ_VAE_SIZE_MB", defaults.cache.vae_size_bytes)?,
            lora_size_bytes: parse_mb(
                &lookup,
                "XYZ_LORA_SIZE_MB",
                defaults.cache.lora_size_bytes,
            )?,
        };
        cache.validate()?;

        let tracker = TrackerConfig {
            history_limit: parse_var(
                &lookup,
                "XYZ_HISTORY_LIMIT",
                "integer",
                defaults.tracker.history_limit,
            )?,
            preview_limit: parse_var(
                &lookup,
                "XYZ_PREVIEW_LIMIT",
                "integer",
                defaults.tracker.preview_limit,
            )?,
        };
        tracker.validate()?;

        let log_json = parse_var(&lookup, "XYZ_LOG_JSON", "boolean", defaults.log_json)?;

        Ok(Self {
            cache,
            tracker,
            log_json,
        })
    }
}

fn parse_var<F, T>(
    lookup: &F,
    var: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            expected,
            value: raw,
        }),
    }
}

fn parse_mb<F>(lookup: &F, var: &'static str, default_bytes: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mb: u64 = parse_var(lookup, var, "size in MB", default_bytes / BYTES_PER_MB)?;
    Ok(mb.saturating_mul(BYTES_PER_MB))
}
