//! Synchronous progress observers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use xyzgrid_core::progress::GridProgressSnapshot;

/// Identifies a registered observer so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u64);

#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    #[error("Observer failed: {0}")]
    Failed(String),
}

/// Receives a snapshot after every state change of a tracked batch.
///
/// Called on the tracker caller's thread with no tracker lock held.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, snapshot: &GridProgressSnapshot) -> Result<(), ObserverError>;
}

impl<F> ProgressObserver for F
where
    F: Fn(&GridProgressSnapshot) -> Result<(), ObserverError> + Send + Sync,
{
    fn on_progress(&self, snapshot: &GridProgressSnapshot) -> Result<(), ObserverError> {
        self(snapshot)
    }
}

/// Invoke every observer in order. An error or panic from one observer is
/// logged and does not stop the others.
pub(crate) fn notify_all(
    observers: &[(ObserverId, Arc<dyn ProgressObserver>)],
    snapshot: &GridProgressSnapshot,
) {
    for (id, observer) in observers {
        match catch_unwind(AssertUnwindSafe(|| observer.on_progress(snapshot))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    observer_id = id.0,
                    batch_id = %snapshot.batch_id,
                    error = %e,
                    "Progress observer failed"
                );
            }
            Err(_) => {
                tracing::warn!(
                    observer_id = id.0,
                    batch_id = %snapshot.batch_id,
                    "Progress observer panicked"
                );
            }
        }
    }
}
