//! Progress tracking for concurrently running grid batches.
//!
//! [`ProgressTracker`] keeps every non-terminal batch in an active map and
//! the most recent terminal batches in a bounded history. Every state
//! change is published, in order, to:
//!
//! 1. the registered [`ProgressObserver`]s, synchronously;
//! 2. the optional [`RemoteNotifier`] (remote viewers);
//! 3. the [`ProgressBus`] for asynchronous subscribers.
//!
//! Failures at any of these stages are logged and contained. Unknown batch
//! ids are not errors: the call is a no-op returning `None`, so late or
//! duplicate calls after completion are harmless.
//!
//! The active/history transition happens under a single lock so concurrent
//! updates to the same batch are never lost. Notification runs after the
//! lock is released.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use xyzgrid_core::progress::{
    GridProgress, GridProgressSnapshot, GridUpdate, DEFAULT_PREVIEW_LIMIT,
};
use xyzgrid_core::types::{BatchId, Timestamp};
use xyzgrid_core::CoreError;

use crate::broadcast::RemoteNotifier;
use crate::bus::ProgressBus;
use crate::observer::{notify_all, ObserverId, ProgressObserver};

/// Number of terminal batches retained by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Terminal batches kept for lookup; the oldest is dropped first.
    pub history_limit: usize,
    /// Preview artifacts kept per batch; the oldest is dropped first.
    pub preview_limit: usize,
}

impl TrackerConfig {
    /// Rules:
    /// - `history_limit` must be at least 1, so a finished batch stays
    ///   retrievable.
    /// - `preview_limit` must be at least 1.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.history_limit == 0 {
            return Err(CoreError::Validation(
                "History limit must be at least 1".to_string(),
            ));
        }
        if self.preview_limit == 0 {
            return Err(CoreError::Validation(
                "Preview limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            preview_limit: DEFAULT_PREVIEW_LIMIT,
        }
    }
}

#[derive(Default)]
struct TrackerState {
    active: HashMap<BatchId, GridProgress>,
    history: VecDeque<GridProgress>,
}

impl TrackerState {
    /// Move an active batch to history after applying a terminal
    /// transition. `None` if the batch is not active.
    fn retire<F>(
        &mut self,
        batch_id: &str,
        transition: F,
        history_limit: usize,
        now: Timestamp,
    ) -> Option<GridProgressSnapshot>
    where
        F: FnOnce(&mut GridProgress) -> bool,
    {
        let mut record = self.active.remove(batch_id)?;
        transition(&mut record);
        let snapshot = record.snapshot_at(now);
        self.history.push_back(record);
        while self.history.len() > history_limit {
            self.history.pop_front();
        }
        Some(snapshot)
    }
}

/// Tracks the progress of grid batches and publishes every change.
pub struct ProgressTracker {
    config: TrackerConfig,
    state: Mutex<TrackerState>,
    observers: RwLock<Vec<(ObserverId, Arc<dyn ProgressObserver>)>>,
    next_observer_id: AtomicU64,
    remote: Option<Arc<dyn RemoteNotifier>>,
    bus: ProgressBus,
}

impl ProgressTracker {
    /// Create a tracker. Zero limits are raised to 1; use
    /// [`TrackerConfig::validate`] to reject them up front instead.
    pub fn new(config: TrackerConfig) -> Self {
        if let Err(e) = config.validate() {
            tracing::warn!(error = %e, "Tracker limits raised to 1");
        }
        let config = TrackerConfig {
            history_limit: config.history_limit.max(1),
            preview_limit: config.preview_limit.max(1),
        };
        Self {
            config,
            state: Mutex::new(TrackerState::default()),
            observers: RwLock::new(Vec::new()),
            next_observer_id: AtomicU64::new(1),
            remote: None,
            bus: ProgressBus::default(),
        }
    }

    /// Attach the secondary notification path for remote viewers.
    pub fn with_remote(mut self, notifier: Arc<dyn RemoteNotifier>) -> Self {
        self.remote = Some(notifier);
        self
    }

    pub fn config(&self) -> TrackerConfig {
        self.config
    }

    // -- observers --

    /// Register an observer. Observers are called in registration order.
    pub fn add_observer(&self, observer: impl ProgressObserver + 'static) -> ObserverId {
        let id = ObserverId(self.next_observer_id.fetch_add(1, Ordering::Relaxed));
        let observer: Arc<dyn ProgressObserver> = Arc::new(observer);
        self.observers.write().push((id, observer));
        id
    }

    /// Unregister an observer. Returns whether it was registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Receive every snapshot asynchronously, isolated from the
    /// synchronous observer path.
    pub fn subscribe(&self) -> broadcast::Receiver<GridProgressSnapshot> {
        self.bus.subscribe()
    }

    // -- lifecycle --

    /// Begin tracking a batch of `total_images`, already running.
    ///
    /// An existing active batch with the same id is silently replaced.
    pub fn start(&self, batch_id: impl Into<BatchId>, total_images: u32) -> GridProgressSnapshot {
        let batch_id = batch_id.into();
        let now = chrono::Utc::now();
        let mut record = GridProgress::started_at(batch_id.clone(), total_images, now);
        record.mark_running();
        let snapshot = record.snapshot_at(now);

        let replaced = self
            .state
            .lock()
            .active
            .insert(batch_id.clone(), record)
            .is_some();
        if replaced {
            tracing::debug!(batch_id = %batch_id, "Replaced active batch with the same id");
        }

        tracing::info!(batch_id = %batch_id, total_images, "Grid batch started");
        self.notify(&snapshot);
        snapshot
    }

    /// Record progress on an active batch.
    ///
    /// Without an explicit `completed` count, one more image is counted.
    /// Labels replace the current labels wholesale; a preview is appended.
    /// When the completed count reaches the total, the batch is completed
    /// within the same call and the returned snapshot is the terminal one.
    pub fn update(&self, batch_id: &str, update: GridUpdate) -> Option<GridProgressSnapshot> {
        let now = chrono::Utc::now();
        let mut snapshots = {
            let mut state = self.state.lock();
            let record = state.active.get_mut(batch_id)?;

            record.completed_images = match update.completed {
                Some(completed) => completed,
                None => record.completed_images.saturating_add(1),
            };
            if let Some(labels) = update.labels {
                record.current_labels = labels;
            }
            if let Some(preview) = update.preview {
                record.push_preview(preview, self.config.preview_limit);
            }

            let mut snapshots = vec![record.snapshot_at(now)];
            if record.is_finished() {
                snapshots.extend(state.retire(
                    batch_id,
                    |r| r.mark_completed(now),
                    self.config.history_limit,
                    now,
                ));
            }
            snapshots
        };

        tracing::debug!(
            batch_id,
            completed_images = snapshots[0].completed_images,
            total_images = snapshots[0].total_images,
            "Grid batch progress",
        );
        if snapshots.len() > 1 {
            tracing::info!(batch_id, "Grid batch completed");
        }

        for snapshot in &snapshots {
            self.notify(snapshot);
        }
        snapshots.pop()
    }

    /// Mark an active batch completed and move it to history.
    pub fn complete(&self, batch_id: &str) -> Option<GridProgressSnapshot> {
        let now = chrono::Utc::now();
        let snapshot = self.state.lock().retire(
            batch_id,
            |r| r.mark_completed(now),
            self.config.history_limit,
            now,
        )?;
        tracing::info!(batch_id, "Grid batch completed");
        self.notify(&snapshot);
        Some(snapshot)
    }

    /// Mark an active batch failed with `message` and move it to history.
    pub fn error(
        &self,
        batch_id: &str,
        message: impl Into<String>,
    ) -> Option<GridProgressSnapshot> {
        let now = chrono::Utc::now();
        let message = message.into();
        let snapshot = self.state.lock().retire(
            batch_id,
            |r| r.mark_failed(message.clone(), now),
            self.config.history_limit,
            now,
        )?;
        tracing::error!(batch_id, error = %message, "Grid batch failed");
        self.notify(&snapshot);
        Some(snapshot)
    }

    // -- queries --

    /// Look up a batch, active first, then history (newest first).
    pub fn get(&self, batch_id: &str) -> Option<GridProgress> {
        let state = self.state.lock();
        state.active.get(batch_id).cloned().or_else(|| {
            state
                .history
                .iter()
                .rev()
                .find(|r| r.batch_id == batch_id)
                .cloned()
        })
    }

    pub fn is_active(&self, batch_id: &str) -> bool {
        self.state.lock().active.contains_key(batch_id)
    }

    pub fn active_batches(&self) -> Vec<GridProgressSnapshot> {
        let now = chrono::Utc::now();
        let state = self.state.lock();
        let mut snapshots: Vec<_> = state.active.values().map(|r| r.snapshot_at(now)).collect();
        snapshots.sort_by(|a, b| a.batch_id.cmp(&b.batch_id));
        snapshots
    }

    /// Terminal batches, oldest first.
    pub fn history(&self) -> Vec<GridProgressSnapshot> {
        let now = chrono::Utc::now();
        self.state
            .lock()
            .history
            .iter()
            .map(|r| r.snapshot_at(now))
            .collect()
    }

    // -- notification --

    fn notify(&self, snapshot: &GridProgressSnapshot) {
        let observers = self.observers.read().clone();
        notify_all(&observers, snapshot);

        if let Some(remote) = self.remote.as_ref() {
            match catch_unwind(AssertUnwindSafe(|| remote.notify(snapshot))) {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        batch_id = %snapshot.batch_id,
                        error = %e,
                        "Remote progress notification failed",
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        batch_id = %snapshot.batch_id,
                        "Remote progress notification panicked",
                    );
                }
            }
        }

        self.bus.publish(snapshot.clone());
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use xyzgrid_core::progress::{GridStatus, PreviewImage};

    #[test]
    fn default_config_is_valid() {
        assert_matches!(TrackerConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let no_history = TrackerConfig {
            history_limit: 0,
            ..TrackerConfig::default()
        };
        assert_matches!(
            no_history.validate(),
            Err(CoreError::Validation(msg)) if msg.contains("History")
        );

        let no_previews = TrackerConfig {
            preview_limit: 0,
            ..TrackerConfig::default()
        };
        assert_matches!(
            no_previews.validate(),
            Err(CoreError::Validation(msg)) if msg.contains("Preview")
        );
    }

    #[test]
    fn finished_batch_stays_retrievable_with_zero_history_limit() {
        let tracker = ProgressTracker::new(TrackerConfig {
            history_limit: 0,
            preview_limit: 0,
        });
        assert_eq!(tracker.config(), TrackerConfig { history_limit: 1, preview_limit: 1 });

        tracker.start("b", 3);
        tracker.update("b", GridUpdate::step().with_preview(PreviewImage::new(vec![1u8])));
        assert_eq!(tracker.get("b").unwrap().preview_count(), 1);

        let done = tracker.complete("b").unwrap();
        assert_eq!(done.status, GridStatus::Completed);
        let record = tracker.get("b").expect("completed batch should be in history");
        assert_eq!(record.status(), GridStatus::Completed);
    }
}
