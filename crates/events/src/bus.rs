//! Asynchronous progress fan-out backed by a `tokio::sync::broadcast` channel.
//!
//! The tracker invokes its registered observers synchronously, so a slow
//! observer stalls progress reporting. Consumers that need isolation
//! subscribe to the [`ProgressBus`] instead and receive snapshots on their
//! own task, accepting that they may trail the tracker's state. [`relay`]
//! runs a [`ProgressObserver`] that way.

use tokio::sync::broadcast;
use xyzgrid_core::progress::GridProgressSnapshot;

use crate::observer::ProgressObserver;

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out of progress snapshots.
pub struct ProgressBus {
    sender: broadcast::Sender<GridProgressSnapshot>,
}

impl ProgressBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed snapshots are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a snapshot to all current subscribers.
    ///
    /// If there are no active subscribers the snapshot is silently dropped.
    pub fn publish(&self, snapshot: GridProgressSnapshot) {
        // Ignore the SendError -- it only means there are zero receivers.
        let _ = self.sender.send(snapshot);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GridProgressSnapshot> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Feed every snapshot from `receiver` to `observer` until the bus closes.
///
/// Meant to be spawned as a background task. Observer errors are logged and
/// the loop keeps going.
pub async fn relay<O>(mut receiver: broadcast::Receiver<GridProgressSnapshot>, observer: O)
where
    O: ProgressObserver,
{
    loop {
        match receiver.recv().await {
            Ok(snapshot) => {
                if let Err(e) = observer.on_progress(&snapshot) {
                    tracing::warn!(
                        batch_id = %snapshot.batch_id,
                        error = %e,
                        "Relayed progress observer failed"
                    );
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Progress relay lagged, some snapshots were skipped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!("Progress bus closed, relay shutting down");
                break;
            }
        }
    }
}
