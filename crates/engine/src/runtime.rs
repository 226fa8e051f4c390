use std::sync::Arc;

use xyzgrid_cache::{CacheManager, DeviceMemory, SystemMemoryProbe};
use xyzgrid_core::CoreError;
use xyzgrid_events::{ProgressBroadcaster, ProgressTracker, RemoteNotifier, TrackerConfig};

use crate::config::{ConfigError, RuntimeConfig};
use crate::runner::{CellRenderer, GridRunner};

/// The process-wide grid runtime: one cache manager, one progress tracker
/// and the remote broadcaster the tracker notifies.
///
/// Construct it once at startup and share it (it is cheap to clone).
pub struct GridRuntime<M, V, L> {
    cache: Arc<CacheManager<M, V, L>>,
    tracker: Arc<ProgressTracker>,
    broadcaster: Arc<ProgressBroadcaster>,
}

impl<M, V, L> Clone for GridRuntime<M, V, L> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
            tracker: Arc::clone(&self.tracker),
            broadcaster: Arc::clone(&self.broadcaster),
        }
    }
}

impl<M, V, L> GridRuntime<M, V, L>
where
    M: Send + Sync + 'static,
    V: Send + Sync + 'static,
    L: Send + Sync + 'static,
{
    pub fn new(config: RuntimeConfig, device: Arc<dyn DeviceMemory>) -> Result<Self, CoreError> {
        config.tracker.validate()?;
        let cache = CacheManager::new(config.cache, device)?;
        Ok(Self::from_parts(cache, config.tracker))
    }

    /// Build from a cache manager that already has its release strategies
    /// installed.
    pub fn from_parts(cache: CacheManager<M, V, L>, tracker: TrackerConfig) -> Self {
        let broadcaster = Arc::new(ProgressBroadcaster::new());
        let remote: Arc<dyn RemoteNotifier> = broadcaster.clone();
        let tracker = ProgressTracker::new(tracker).with_remote(remote);
        Self {
            cache: Arc::new(cache),
            tracker: Arc::new(tracker),
            broadcaster,
        }
    }

    /// Load configuration from the environment and probe the real device.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = RuntimeConfig::from_env()?;
        let device: Arc<dyn DeviceMemory> = Arc::new(SystemMemoryProbe::new());
        Ok(Self::new(config, device)?)
    }

    pub fn cache(&self) -> &Arc<CacheManager<M, V, L>> {
        &self.cache
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    /// Bind `renderer` to the shared model cache and tracker.
    pub fn runner<R>(&self, renderer: R) -> GridRunner<R, V, L>
    where
        R: CellRenderer<Model = M>,
    {
        GridRunner::new(renderer, Arc::clone(&self.cache), Arc::clone(&self.tracker))
    }

    /// Disconnect remote viewers and release every cached resource.
    pub fn shutdown(&self) -> usize {
        self.broadcaster.shutdown_all();
        let released = self.cache.clear_all();
        tracing::info!(released, "Grid runtime shut down");
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xyzgrid_cache::FixedMemoryProbe;
    use xyzgrid_events::ListenerMessage;

    const GB: u64 = 1024 * 1024 * 1024;

    fn runtime() -> GridRuntime<String, String, String> {
        GridRuntime::new(
            RuntimeConfig::default(),
            Arc::new(FixedMemoryProbe::new(20 * GB, 24 * GB)),
        )
        .unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.cache.capacity = 0;
        let result: Result<GridRuntime<String, String, String>, _> =
            GridRuntime::new(config, Arc::new(FixedMemoryProbe::new(GB, GB)));
        assert!(result.is_err());
    }

    #[test]
    fn zero_history_limit_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.tracker.history_limit = 0;
        let result: Result<GridRuntime<String, String, String>, _> =
            GridRuntime::new(config, Arc::new(FixedMemoryProbe::new(GB, GB)));
        assert!(result.is_err());
    }

    #[test]
    fn clones_share_state() {
        let rt = runtime();
        let other = rt.clone();
        rt.cache().cache_model("sd15", Arc::new("weights".to_string()));
        assert!(other.cache().get_model("sd15").is_some());
        assert!(Arc::ptr_eq(rt.tracker(), other.tracker()));
    }

    #[tokio::test]
    async fn tracker_notifies_remote_listeners() {
        let rt = runtime();
        let mut rx = rt.broadcaster().add("viewer");

        rt.tracker().start("batch-1", 2);

        let Some(ListenerMessage::Text(text)) = rx.recv().await else {
            panic!("expected a text message");
        };
        assert!(text.contains("\"batch_id\":\"batch-1\""));
    }

    #[tokio::test]
    async fn shutdown_closes_listeners_and_clears_cache() {
        let rt = runtime();
        let mut rx = rt.broadcaster().add("viewer");
        rt.cache().cache_model("a", Arc::new("a".to_string()));
        rt.cache().cache_vae("v", Arc::new("v".to_string()));

        assert_eq!(rt.shutdown(), 2);
        assert_eq!(rx.recv().await, Some(ListenerMessage::Close));
        assert_eq!(rt.cache().stats().models_cached, 0);
    }
}
