use crate::protocol::{Outbound, ServerFrame};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, Notify};

/// Handle to one live connection, held by the registry.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Distinguishes successive connections of the same player.
    pub id: u64,
    outbound: Outbound,
    shutdown: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(outbound: Outbound) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            outbound,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Resolves once the registry wants this connection closed.
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    fn close(&self) {
        // notify_one stores a permit, so a close issued before the
        // connection starts waiting is not lost
        self.shutdown.notify_one();
    }

    fn push(&self, frame: ServerFrame) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

/// Maps each authenticated player to their single live connection.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as the player's connection. A previous connection
    /// of the same player is evicted and told to close.
    pub async fn register(&self, player_id: &str, handle: ConnectionHandle) {
        let previous = self
            .connections
            .lock()
            .await
            .insert(player_id.to_string(), handle);

        if let Some(previous) = previous {
            tracing::info!(player_id, connection = previous.id, "Superseding existing connection");
            previous.close();
        }
    }

    /// Remove the player's mapping if it still belongs to `connection_id`.
    /// Returns false when a newer connection has taken over.
    pub async fn unregister(&self, player_id: &str, connection_id: u64) -> bool {
        let mut connections = self.connections.lock().await;
        match connections.get(player_id) {
            Some(handle) if handle.id == connection_id => {
                connections.remove(player_id);
                true
            }
            _ => false,
        }
    }

    /// Force-close the player's connection, if any. Cleanup runs on the
    /// connection's own task.
    pub async fn disconnect(&self, player_id: &str) -> bool {
        let connections = self.connections.lock().await;
        match connections.get(player_id) {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    pub async fn is_connected(&self, player_id: &str) -> bool {
        self.connections.lock().await.contains_key(player_id)
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Push an unsolicited frame to one player. Returns false if the player
    /// is not connected.
    pub async fn send<T: Serialize + ?Sized>(&self, player_id: &str, event_name: &str, data: &T) -> bool {
        let frame = ServerFrame::push(event_name, data);
        match self.connections.lock().await.get(player_id) {
            Some(handle) => handle.push(frame),
            None => false,
        }
    }

    /// Push an unsolicited frame to every connected player.
    // TODO: fan-out is linear in connection count; move lobby broadcasts to
    // per-track subscriptions once lobbies grow.
    pub async fn send_global<T: Serialize + ?Sized>(&self, event_name: &str, data: &T) {
        let frame = ServerFrame::push(event_name, data);
        let connections = self.connections.lock().await;
        for handle in connections.values() {
            handle.push(frame.clone());
        }
    }

    /// Push one frame to each of the given players.
    pub async fn send_many<T: Serialize + ?Sized>(&self, player_ids: &[String], event_name: &str, data: &T) {
        let frame = ServerFrame::push(event_name, data);
        let connections = self.connections.lock().await;
        for player_id in player_ids {
            if let Some(handle) = connections.get(player_id) {
                handle.push(frame.clone());
            }
        }
    }
}
