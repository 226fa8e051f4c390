//! Remote viewer fan-out for grid progress.
//!
//! [`ProgressBroadcaster`] is the secondary notification path: every
//! snapshot is serialized once as JSON tagged with
//! `"type": "xyz_grid_progress"` and pushed to each registered listener's
//! channel. The transport behind a listener (WebSocket, SSE...) forwards the
//! channel to its sink. A listener whose channel has closed is pruned; the
//! others still receive the message.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use xyzgrid_core::progress::{GridProgressSnapshot, MSG_TYPE_XYZ_GRID_PROGRESS};
use xyzgrid_core::types::Timestamp;

/// A message pushed to a remote listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerMessage {
    /// A JSON-encoded progress update.
    Text(String),
    /// The broadcaster is shutting down.
    Close,
}

/// Channel sender half for pushing messages to one listener.
pub type ListenerSender = mpsc::UnboundedSender<ListenerMessage>;

/// Metadata for a single remote listener.
pub struct Listener {
    pub sender: ListenerSender,
    /// When this listener was registered.
    pub connected_at: Timestamp,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Failed to encode progress message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Delivers progress snapshots to remote viewers.
pub trait RemoteNotifier: Send + Sync {
    /// Push `snapshot` to every listener. Returns how many received it.
    fn notify(&self, snapshot: &GridProgressSnapshot) -> Result<usize, NotifyError>;
}

#[derive(Serialize)]
struct ProgressPush<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    #[serde(flatten)]
    snapshot: &'a GridProgressSnapshot,
}

/// Encode a snapshot as the JSON text sent to remote viewers.
pub fn encode_progress(snapshot: &GridProgressSnapshot) -> Result<String, NotifyError> {
    Ok(serde_json::to_string(&ProgressPush {
        msg_type: MSG_TYPE_XYZ_GRID_PROGRESS,
        snapshot,
    })?)
}

/// Manages all registered remote listeners.
///
/// Thread-safe via interior `RwLock`; designed to be wrapped in `Arc` and
/// shared across the application.
pub struct ProgressBroadcaster {
    listeners: RwLock<HashMap<String, Listener>>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Register a listener. Re-using an id replaces the previous listener.
    ///
    /// Returns the receiver half of the message channel so the caller can
    /// forward messages to its transport.
    pub fn add(&self, conn_id: impl Into<String>) -> mpsc::UnboundedReceiver<ListenerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Listener {
            sender: tx,
            connected_at: chrono::Utc::now(),
        };
        self.listeners.write().insert(conn_id.into(), listener);
        rx
    }

    /// Remove a listener by its id.
    pub fn remove(&self, conn_id: &str) {
        self.listeners.write().remove(conn_id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Send a message to every listener, pruning those whose channel is
    /// closed. Returns the number of listeners that received it.
    pub fn broadcast(&self, message: ListenerMessage) -> usize {
        let mut dead = Vec::new();
        let mut delivered = 0;
        {
            let listeners = self.listeners.read();
            for (id, listener) in listeners.iter() {
                match listener.sender.send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => dead.push(id.clone()),
                }
            }
        }

        if !dead.is_empty() {
            let mut listeners = self.listeners.write();
            for id in &dead {
                // Only prune if the id still maps to a closed channel; it may
                // have been re-registered meanwhile.
                if listeners.get(id).is_some_and(|l| l.sender.is_closed()) {
                    listeners.remove(id);
                }
            }
            tracing::debug!(pruned = dead.len(), "Pruned disconnected progress listeners");
        }

        delivered
    }

    /// Send a Close message to every listener, then clear the map.
    pub fn shutdown_all(&self) {
        let mut listeners = self.listeners.write();
        let count = listeners.len();
        for listener in listeners.values() {
            let _ = listener.sender.send(ListenerMessage::Close);
        }
        listeners.clear();
        tracing::info!(count, "Closed all progress listeners");
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteNotifier for ProgressBroadcaster {
    fn notify(&self, snapshot: &GridProgressSnapshot) -> Result<usize, NotifyError> {
        let text = encode_progress(snapshot)?;
        Ok(self.broadcast(ListenerMessage::Text(text)))
    }
}
