//! Per-batch progress record for XYZ grid generation.
//!
//! [`GridProgress`] is the mutable state of one batch. Derived metrics
//! (percent complete, elapsed time, ETA) are computed on demand and never
//! stored. [`GridProgressSnapshot`] is the serializable projection handed to
//! observers and remote viewers; raw preview artifacts are replaced by a
//! count.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{BatchId, Timestamp};

/// Message type discriminator for progress pushed to remote viewers.
pub const MSG_TYPE_XYZ_GRID_PROGRESS: &str = "xyz_grid_progress";

/// Number of preview artifacts retained per batch by default.
pub const DEFAULT_PREVIEW_LIMIT: usize = 5;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a grid batch.
///
/// Transitions only move forward: `Initializing -> Running -> Completed`
/// or `Running -> Error`. The last two are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridStatus {
    Initializing,
    Running,
    Completed,
    Error,
}

impl GridStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, GridStatus::Completed | GridStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GridStatus::Initializing => "initializing",
            GridStatus::Running => "running",
            GridStatus::Completed => "completed",
            GridStatus::Error => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// Preview artifacts
// ---------------------------------------------------------------------------

/// An opaque preview artifact (encoded image bytes) for a finished cell.
///
/// Cloning is cheap; the bytes are shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewImage(Arc<[u8]>);

impl PreviewImage {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// GridProgress
// ---------------------------------------------------------------------------

/// Execution state of one grid batch.
#[derive(Debug, Clone)]
pub struct GridProgress {
    pub batch_id: BatchId,
    total_images: u32,
    pub completed_images: u32,
    pub start_time: Timestamp,
    end_time: Option<Timestamp>,
    /// Axis id -> human-readable label of the cell currently rendering.
    pub current_labels: BTreeMap<String, String>,
    preview_images: VecDeque<PreviewImage>,
    status: GridStatus,
    error_message: Option<String>,
}

impl GridProgress {
    /// Create a record in the `Initializing` state, started now.
    pub fn new(batch_id: impl Into<BatchId>, total_images: u32) -> Self {
        Self::started_at(batch_id, total_images, chrono::Utc::now())
    }

    /// Create a record with an explicit start time.
    pub fn started_at(batch_id: impl Into<BatchId>, total_images: u32, start: Timestamp) -> Self {
        Self {
            batch_id: batch_id.into(),
            total_images,
            completed_images: 0,
            start_time: start,
            end_time: None,
            current_labels: BTreeMap::new(),
            preview_images: VecDeque::new(),
            status: GridStatus::Initializing,
            error_message: None,
        }
    }

    pub fn total_images(&self) -> u32 {
        self.total_images
    }

    pub fn end_time(&self) -> Option<Timestamp> {
        self.end_time
    }

    pub fn status(&self) -> GridStatus {
        self.status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn preview_images(&self) -> impl Iterator<Item = &PreviewImage> {
        self.preview_images.iter()
    }

    pub fn preview_count(&self) -> usize {
        self.preview_images.len()
    }

    /// Whether the caller-reported count has reached the batch total.
    pub fn is_finished(&self) -> bool {
        self.completed_images >= self.total_images
    }

    /// Append a preview, dropping the oldest ones beyond `limit`.
    pub fn push_preview(&mut self, preview: PreviewImage, limit: usize) {
        self.preview_images.push_back(preview);
        while self.preview_images.len() > limit {
            self.preview_images.pop_front();
        }
    }

    /// Move out of `Initializing`. No-op in any other state.
    pub fn mark_running(&mut self) {
        if self.status == GridStatus::Initializing {
            self.status = GridStatus::Running;
        }
    }

    /// Enter the terminal `Completed` state.
    ///
    /// Returns `false` (and changes nothing) if the record is already
    /// terminal.
    pub fn mark_completed(&mut self, now: Timestamp) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = GridStatus::Completed;
        self.end_time = Some(now);
        true
    }

    /// Enter the terminal `Error` state with a message.
    ///
    /// Returns `false` (and changes nothing) if the record is already
    /// terminal.
    pub fn mark_failed(&mut self, message: impl Into<String>, now: Timestamp) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = GridStatus::Error;
        self.error_message = Some(message.into());
        self.end_time = Some(now);
        true
    }

    /// `completed / total * 100`, or 0 when the batch has no images.
    pub fn progress_percent(&self) -> f64 {
        if self.total_images == 0 {
            return 0.0;
        }
        f64::from(self.completed_images) / f64::from(self.total_images) * 100.0
    }

    /// Seconds from start to `end_time`, or to `now` while still active.
    pub fn elapsed_secs_at(&self, now: Timestamp) -> f64 {
        let end = self.end_time.unwrap_or(now);
        let millis = end.signed_duration_since(self.start_time).num_milliseconds();
        millis.max(0) as f64 / 1000.0
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed_secs_at(chrono::Utc::now())
    }

    /// `(elapsed / completed) * (total - completed)` seconds.
    ///
    /// `None` until at least one image is completed. Zero once the
    /// completed count reaches or passes the total.
    pub fn estimated_remaining_secs_at(&self, now: Timestamp) -> Option<f64> {
        if self.completed_images == 0 {
            return None;
        }
        let per_image = self.elapsed_secs_at(now) / f64::from(self.completed_images);
        let remaining = self.total_images.saturating_sub(self.completed_images);
        Some(per_image * f64::from(remaining))
    }

    pub fn estimated_remaining_secs(&self) -> Option<f64> {
        self.estimated_remaining_secs_at(chrono::Utc::now())
    }

    pub fn snapshot(&self) -> GridProgressSnapshot {
        self.snapshot_at(chrono::Utc::now())
    }

    /// Project the record into its serializable form, computing derived
    /// metrics against `now`.
    pub fn snapshot_at(&self, now: Timestamp) -> GridProgressSnapshot {
        GridProgressSnapshot {
            batch_id: self.batch_id.clone(),
            total_images: self.total_images,
            completed_images: self.completed_images,
            progress_percent: self.progress_percent(),
            elapsed_time: self.elapsed_secs_at(now),
            estimated_remaining: self.estimated_remaining_secs_at(now),
            current_labels: self.current_labels.clone(),
            status: self.status,
            error_message: self.error_message.clone(),
            preview_count: self.preview_images.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Serializable view of a [`GridProgress`] delivered to observers.
///
/// Times are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridProgressSnapshot {
    pub batch_id: BatchId,
    pub total_images: u32,
    pub completed_images: u32,
    pub progress_percent: f64,
    pub elapsed_time: f64,
    pub estimated_remaining: Option<f64>,
    pub current_labels: BTreeMap<String, String>,
    pub status: GridStatus,
    pub error_message: Option<String>,
    pub preview_count: usize,
}

// ---------------------------------------------------------------------------
// Update request
// ---------------------------------------------------------------------------

/// Optional fields of a progress update.
///
/// An update with no `completed` value counts one more finished image.
#[derive(Debug, Clone, Default)]
pub struct GridUpdate {
    pub completed: Option<u32>,
    pub labels: Option<BTreeMap<String, String>>,
    pub preview: Option<PreviewImage>,
}

impl GridUpdate {
    /// One more image finished, nothing else changes.
    pub fn step() -> Self {
        Self::default()
    }

    pub fn with_completed(mut self, completed: u32) -> Self {
        self.completed = Some(completed);
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_preview(mut self, preview: PreviewImage) -> Self {
        self.preview = Some(preview);
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
