//! Integration tests for `ProgressTracker`.
//!
//! These drive the tracker the way a batch driver does (start, update per
//! finished cell, complete or error) and verify the active/history
//! bookkeeping and observer fan-out.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use xyzgrid_core::progress::{GridProgressSnapshot, GridStatus, GridUpdate, PreviewImage};
use xyzgrid_events::{
    ObserverError, ProgressBroadcaster, ProgressTracker, RemoteNotifier, TrackerConfig,
};
use xyzgrid_events::broadcast::ListenerMessage;

type Seen = Arc<Mutex<Vec<GridProgressSnapshot>>>;

fn recording_tracker() -> (ProgressTracker, Seen) {
    let tracker = ProgressTracker::default();
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    tracker.add_observer(move |s: &GridProgressSnapshot| -> Result<(), ObserverError> {
        sink.lock().unwrap().push(s.clone());
        Ok(())
    });
    (tracker, seen)
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// ---------------------------------------------------------------------------
// Test: start creates a running batch and notifies
// ---------------------------------------------------------------------------

#[test]
fn start_creates_running_batch() {
    let (tracker, seen) = recording_tracker();

    let snapshot = tracker.start("b1", 4);

    assert_eq!(snapshot.status, GridStatus::Running);
    assert_eq!(snapshot.completed_images, 0);
    assert!(snapshot.estimated_remaining.is_none());
    assert!(tracker.is_active("b1"));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Test: update without a count increments by one
// ---------------------------------------------------------------------------

#[test]
fn update_increments_by_one() {
    let (tracker, _) = recording_tracker();
    tracker.start("b1", 4);

    tracker.update("b1", GridUpdate::step());
    let snapshot = tracker.update("b1", GridUpdate::step()).unwrap();

    assert_eq!(snapshot.completed_images, 2);
    assert_eq!(snapshot.progress_percent, 50.0);
    assert!(snapshot.estimated_remaining.is_some());
}

// ---------------------------------------------------------------------------
// Test: explicit count is taken as-is, without monotonicity checks
// ---------------------------------------------------------------------------

#[test]
fn explicit_count_is_not_enforced_monotonic() {
    let (tracker, _) = recording_tracker();
    tracker.start("b1", 10);

    tracker.update("b1", GridUpdate::default().with_completed(6));
    let snapshot = tracker
        .update("b1", GridUpdate::default().with_completed(3))
        .unwrap();

    assert_eq!(snapshot.completed_images, 3);
    assert!(tracker.is_active("b1"));
}

// ---------------------------------------------------------------------------
// Test: labels are replaced wholesale
// ---------------------------------------------------------------------------

#[test]
fn labels_replace_previous_labels() {
    let (tracker, _) = recording_tracker();
    tracker.start("b1", 10);

    tracker.update(
        "b1",
        GridUpdate::step().with_labels(labels(&[("x", "sd15"), ("y", "euler")])),
    );
    let snapshot = tracker
        .update("b1", GridUpdate::step().with_labels(labels(&[("x", "sdxl")])))
        .unwrap();

    assert_eq!(snapshot.current_labels, labels(&[("x", "sdxl")]));
}

// ---------------------------------------------------------------------------
// Test: only the five most recent previews are kept
// ---------------------------------------------------------------------------

#[test]
fn previews_are_bounded() {
    let (tracker, _) = recording_tracker();
    tracker.start("b1", 100);

    for i in 0..7u8 {
        tracker.update("b1", GridUpdate::step().with_preview(PreviewImage::new(vec![i])));
    }

    let record = tracker.get("b1").unwrap();
    let kept: Vec<u8> = record.preview_images().map(|p| p.as_bytes()[0]).collect();
    assert_eq!(kept, vec![2, 3, 4, 5, 6]);
    assert_eq!(record.snapshot().preview_count, 5);
}

// ---------------------------------------------------------------------------
// Test: reaching the total completes the batch within the same call
// ---------------------------------------------------------------------------

#[test]
fn final_update_completes_batch() {
    let (tracker, seen) = recording_tracker();
    tracker.start("b1", 2);
    tracker.update("b1", GridUpdate::step());

    let snapshot = tracker.update("b1", GridUpdate::step()).unwrap();

    assert_eq!(snapshot.status, GridStatus::Completed);
    assert_eq!(snapshot.progress_percent, 100.0);
    assert!(!tracker.is_active("b1"));
    assert!(tracker.active_batches().is_empty());
    let history = tracker.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].batch_id, "b1");
    assert!(tracker.get("b1").unwrap().end_time().is_some());

    let statuses: Vec<GridStatus> = seen.lock().unwrap().iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            GridStatus::Running,
            GridStatus::Running,
            GridStatus::Running,
            GridStatus::Completed,
        ]
    );
}

// ---------------------------------------------------------------------------
// Test: overshooting the total also completes
// ---------------------------------------------------------------------------

#[test]
fn overshooting_count_completes_unclamped() {
    let (tracker, _) = recording_tracker();
    tracker.start("b1", 4);

    let snapshot = tracker
        .update("b1", GridUpdate::default().with_completed(9))
        .unwrap();

    assert_eq!(snapshot.status, GridStatus::Completed);
    assert_eq!(snapshot.completed_images, 9);
}

// ---------------------------------------------------------------------------
// Test: unknown batch ids are harmless no-ops
// ---------------------------------------------------------------------------

#[test]
fn unknown_batch_is_noop() {
    let (tracker, seen) = recording_tracker();

    assert!(tracker.update("ghost", GridUpdate::step()).is_none());
    assert!(tracker.complete("ghost").is_none());
    assert!(tracker.error("ghost", "boom").is_none());
    assert!(tracker.get("ghost").is_none());
    assert!(seen.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Test: terminal calls after completion do not duplicate history
// ---------------------------------------------------------------------------

#[test]
fn late_terminal_calls_do_not_duplicate_history() {
    let (tracker, _) = recording_tracker();
    tracker.start("b1", 4);

    assert!(tracker.complete("b1").is_some());
    assert!(tracker.complete("b1").is_none());
    assert!(tracker.error("b1", "too late").is_none());
    assert!(tracker.update("b1", GridUpdate::step()).is_none());

    assert_eq!(tracker.history().len(), 1);
    assert_eq!(tracker.get("b1").unwrap().status(), GridStatus::Completed);
}

// ---------------------------------------------------------------------------
// Test: error records the message and end time
// ---------------------------------------------------------------------------

#[test]
fn error_moves_batch_to_history() {
    let (tracker, seen) = recording_tracker();
    tracker.start("b1", 4);
    tracker.update("b1", GridUpdate::step());

    let snapshot = tracker.error("b1", "CUDA out of memory").unwrap();

    assert_eq!(snapshot.status, GridStatus::Error);
    assert_eq!(snapshot.error_message.as_deref(), Some("CUDA out of memory"));
    assert_eq!(snapshot.completed_images, 1);
    let record = tracker.get("b1").unwrap();
    assert!(record.end_time().is_some());
    assert_eq!(record.error_message(), Some("CUDA out of memory"));
    assert_eq!(seen.lock().unwrap().last().unwrap().status, GridStatus::Error);
}

// ---------------------------------------------------------------------------
// Test: history keeps the ten most recent terminal batches
// ---------------------------------------------------------------------------

#[test]
fn history_is_bounded() {
    let (tracker, _) = recording_tracker();

    for i in 0..11 {
        let id = format!("b{i}");
        tracker.start(id.clone(), 1);
        tracker.complete(&id);
    }

    let history = tracker.history();
    assert_eq!(history.len(), 10);
    assert_eq!(history.first().unwrap().batch_id, "b1");
    assert_eq!(history.last().unwrap().batch_id, "b10");
    assert!(tracker.get("b0").is_none());
}

// ---------------------------------------------------------------------------
// Test: custom limits are honoured
// ---------------------------------------------------------------------------

#[test]
fn custom_limits() {
    let tracker = ProgressTracker::new(TrackerConfig {
        history_limit: 2,
        preview_limit: 1,
    });
    for id in ["a", "b", "c"] {
        tracker.start(id, 5);
        tracker.update(id, GridUpdate::step().with_preview(PreviewImage::new(vec![1])));
        tracker.update(id, GridUpdate::step().with_preview(PreviewImage::new(vec![2])));
        tracker.complete(id);
    }

    let history = tracker.history();
    let ids: Vec<&str> = history.iter().map(|s| s.batch_id.as_str()).collect();
    assert_eq!(ids, vec!["b", "c"]);
    assert_eq!(history[1].preview_count, 1);
}

// ---------------------------------------------------------------------------
// Test: duplicate start silently replaces the active record
// ---------------------------------------------------------------------------

#[test]
fn duplicate_start_replaces_active_record() {
    let (tracker, _) = recording_tracker();
    tracker.start("b1", 4);
    tracker.update("b1", GridUpdate::step());

    tracker.start("b1", 8);

    let record = tracker.get("b1").unwrap();
    assert_eq!(record.total_images(), 8);
    assert_eq!(record.completed_images, 0);
    assert_eq!(tracker.active_batches().len(), 1);
}

// ---------------------------------------------------------------------------
// Test: a failing or panicking observer does not affect the others
// ---------------------------------------------------------------------------

#[test]
fn observer_failures_are_contained() {
    let tracker = ProgressTracker::default();
    tracker.add_observer(|_: &GridProgressSnapshot| -> Result<(), ObserverError> {
        Err(ObserverError::Failed("display offline".into()))
    });
    tracker.add_observer(|_: &GridProgressSnapshot| -> Result<(), ObserverError> {
        panic!("observer bug")
    });
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    tracker.add_observer(move |s: &GridProgressSnapshot| -> Result<(), ObserverError> {
        sink.lock().unwrap().push(s.clone());
        Ok(())
    });

    tracker.start("b1", 2);
    let snapshot = tracker.update("b1", GridUpdate::step()).unwrap();

    assert_eq!(snapshot.completed_images, 1);
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(tracker.observer_count(), 3);
}

// ---------------------------------------------------------------------------
// Test: removed observers stop receiving
// ---------------------------------------------------------------------------

#[test]
fn removed_observer_stops_receiving() {
    let tracker = ProgressTracker::default();
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let id = tracker.add_observer(move |s: &GridProgressSnapshot| -> Result<(), ObserverError> {
        sink.lock().unwrap().push(s.clone());
        Ok(())
    });

    tracker.start("b1", 2);
    assert!(tracker.remove_observer(id));
    assert!(!tracker.remove_observer(id));
    tracker.update("b1", GridUpdate::step());

    assert_eq!(seen.lock().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Test: remote viewers receive tagged JSON after local observers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remote_listeners_receive_progress() {
    let broadcaster = Arc::new(ProgressBroadcaster::new());
    let mut rx = broadcaster.add("viewer-1");
    let remote: Arc<dyn RemoteNotifier> = broadcaster.clone();
    let tracker = ProgressTracker::default().with_remote(remote);

    tracker.start("b1", 3);

    let msg = rx.recv().await.expect("viewer should receive start");
    assert_matches!(msg, ListenerMessage::Text(text) => {
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "xyz_grid_progress");
        assert_eq!(json["batch_id"], "b1");
        assert_eq!(json["total_images"], 3);
    });
}

// ---------------------------------------------------------------------------
// Test: asynchronous subscribers see every change
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribers_receive_every_change() {
    let tracker = ProgressTracker::default();
    let mut rx = tracker.subscribe();

    tracker.start("b1", 1);
    tracker.update("b1", GridUpdate::step());

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    let third = rx.recv().await.unwrap();
    assert_eq!(first.status, GridStatus::Running);
    assert_eq!(second.completed_images, 1);
    assert_eq!(third.status, GridStatus::Completed);
}

// ---------------------------------------------------------------------------
// Test: concurrent updates to one batch are not lost
// ---------------------------------------------------------------------------

#[test]
fn concurrent_updates_are_not_lost() {
    let tracker = ProgressTracker::default();
    tracker.start("b1", 100);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..25 {
                    assert!(tracker.update("b1", GridUpdate::step()).is_some());
                }
            });
        }
    });

    let record = tracker.get("b1").unwrap();
    assert_eq!(record.completed_images, 100);
    assert_eq!(record.status(), GridStatus::Completed);
    assert!(!tracker.is_active("b1"));
}
