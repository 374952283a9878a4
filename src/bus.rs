#![forbid(unsafe_code)]

// Event Bus Adapter - the thin seam between the orchestrator and the
// WebSocket layer. Tracks per-connection outbound channels and room-scoped
// broadcast sets; the orchestrator never touches a socket directly.

use crate::signaling::protocol::ServerEvent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Outbound handle for one live connection. Messages are pre-serialized once
/// and shared across recipients.
#[derive(Clone)]
struct ConnectionHandle {
    sender: mpsc::Sender<Arc<String>>,
    close: Arc<Notify>,
}

#[derive(Default)]
struct BusState {
    connections: HashMap<String, ConnectionHandle>,
    /// roomId -> connectionIds currently subscribed to the room's broadcasts.
    scopes: HashMap<String, HashSet<String>>,
}

/// Connection registry plus broadcast scopes.
#[derive(Default)]
pub struct EventBus {
    inner: StdRwLock<BusState>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a live connection. Returns the notifier the connection loop
    /// must watch for forced closes.
    pub fn register(&self, connection_id: &str, sender: mpsc::Sender<Arc<String>>) -> Arc<Notify> {
        let close = Arc::new(Notify::new());
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state.connections.insert(
            connection_id.to_string(),
            ConnectionHandle {
                sender,
                close: Arc::clone(&close),
            },
        );
        close
    }

    /// Removes a connection and drops it from every broadcast scope.
    pub fn unregister(&self, connection_id: &str) {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state.connections.remove(connection_id);
        state.scopes.retain(|_, members| {
            members.remove(connection_id);
            !members.is_empty()
        });
    }

    /// Whether a connection is currently live. The grace timer consults this
    /// at fire time; the registry binding alone is not authoritative.
    pub fn is_live(&self, connection_id: &str) -> bool {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.connections.contains_key(connection_id)
    }

    /// Asks the connection's read loop to shut down. Used when a user
    /// reappears on a fresh connection while the old one is still open.
    pub fn force_close(&self, connection_id: &str) {
        let handle = {
            let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
            state.connections.get(connection_id).cloned()
        };
        if let Some(handle) = handle {
            debug!("Force-closing connection {}", connection_id);
            handle.close.notify_one();
        }
    }

    pub fn join_scope(&self, room_id: &str, connection_id: &str) {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state
            .scopes
            .entry(room_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    pub fn leave_scope(&self, room_id: &str, connection_id: &str) {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(members) = state.scopes.get_mut(room_id) {
            members.remove(connection_id);
            if members.is_empty() {
                state.scopes.remove(room_id);
            }
        }
    }

    /// Sends to a single connection. Best-effort; a full or closed channel is
    /// logged and dropped, never an error for the caller.
    pub fn send_to(&self, connection_id: &str, event: &ServerEvent) {
        let json = match serialize(event) {
            Some(json) => json,
            None => return,
        };
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = state.connections.get(connection_id) {
            deliver(connection_id, handle, &json);
        } else {
            debug!("Dropping event for unknown connection {}", connection_id);
        }
    }

    /// Broadcasts to every connection in the room's scope.
    pub fn broadcast(&self, room_id: &str, event: &ServerEvent) {
        self.broadcast_inner(room_id, None, event);
    }

    /// Broadcasts to every connection in the room's scope except one.
    pub fn broadcast_except(&self, room_id: &str, except: &str, event: &ServerEvent) {
        self.broadcast_inner(room_id, Some(except), event);
    }

    fn broadcast_inner(&self, room_id: &str, except: Option<&str>, event: &ServerEvent) {
        let json = match serialize(event) {
            Some(json) => json,
            None => return,
        };
        // Snapshot recipients before delivering so every recipient of this
        // event observes the same member set.
        let recipients: Vec<(String, ConnectionHandle)> = {
            let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
            let Some(members) = state.scopes.get(room_id) else {
                return;
            };
            members
                .iter()
                .filter(|id| except != Some(id.as_str()))
                .filter_map(|id| {
                    state
                        .connections
                        .get(id)
                        .map(|handle| (id.clone(), handle.clone()))
                })
                .collect()
        };
        for (id, handle) in recipients {
            deliver(&id, &handle, &json);
        }
    }

    pub fn connection_count(&self) -> usize {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        state.connections.len()
    }
}

fn serialize(event: &ServerEvent) -> Option<Arc<String>> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!("Failed to serialize outbound event: {}", e);
            None
        }
    }
}

fn deliver(connection_id: &str, handle: &ConnectionHandle, json: &Arc<String>) {
    match handle.sender.try_send(Arc::clone(json)) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Channel full for connection {}, dropping event", connection_id);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Channel closed for connection {} (disconnected)", connection_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::protocol::ServerEvent;

    fn channel() -> (mpsc::Sender<Arc<String>>, mpsc::Receiver<Arc<String>>) {
        mpsc::channel(8)
    }

    #[tokio::test]
    async fn broadcast_reaches_scope_except_sender() {
        let bus = EventBus::new();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        bus.register("c1", tx1);
        bus.register("c2", tx2);
        bus.join_scope("room-a", "c1");
        bus.join_scope("room-a", "c2");

        bus.broadcast_except("room-a", "c1", &ServerEvent::StopSharing);

        assert!(rx1.try_recv().is_err());
        let got = rx2.try_recv().expect("c2 should receive");
        assert!(got.contains("stop-sharing"));
    }

    #[tokio::test]
    async fn unregister_removes_from_scopes() {
        let bus = EventBus::new();
        let (tx, mut rx) = channel();
        bus.register("c1", tx);
        bus.join_scope("room-a", "c1");
        assert!(bus.is_live("c1"));

        bus.unregister("c1");
        assert!(!bus.is_live("c1"));
        bus.broadcast("room-a", &ServerEvent::StopSharing);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn force_close_notifies_watcher() {
        let bus = EventBus::new();
        let (tx, _rx) = channel();
        let close = bus.register("c1", tx);
        bus.force_close("c1");
        // Notify stores the permit, so this resolves immediately.
        close.notified().await;
    }
}
