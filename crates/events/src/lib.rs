//! Grid progress tracking and notification fan-out.
//!
//! - [`ProgressTracker`] -- active/history state for grid batches with
//!   synchronous observers.
//! - [`ProgressObserver`] -- the callback contract for observers.
//! - [`ProgressBroadcaster`] -- the remote viewer channel, implementing
//!   [`RemoteNotifier`].
//! - [`ProgressBus`] -- `tokio::sync::broadcast` fan-out for asynchronous
//!   subscribers, with [`bus::relay`] to run an observer on its own task.

pub mod broadcast;
pub mod bus;
pub mod observer;
pub mod tracker;

pub use broadcast::{ListenerMessage, NotifyError, ProgressBroadcaster, RemoteNotifier};
pub use bus::ProgressBus;
pub use observer::{ObserverError, ObserverId, ProgressObserver};
pub use tracker::{ProgressTracker, TrackerConfig};
