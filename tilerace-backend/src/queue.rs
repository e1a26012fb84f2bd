//! Per-track matchmaking.
//!
//! Every state transition happens under the queue lock together with its
//! broadcast, so clients observe transitions in the order they were applied.
//! The lock is never held across a store call; whatever was checked before
//! such a call is checked again afterwards.

use crate::client_data::ClientDataCache;
use crate::connections::{ConnectionHandle, ConnectionRegistry};
use crate::error::SessionError;
use crate::helpers::{generate_id, now_millis};
use crate::races::{Race, RaceSessions};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use tilerace_db::{Database, PlayerProfile};
use tokio::sync::Mutex;

/// Lobby of one track.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceQueueEntry {
    pub track_id: String,
    /// Sent as a map of player id to profile, in join order
    #[serde(serialize_with = "players_by_id")]
    pub players: Vec<PlayerProfile>,
    pub players_ready: Vec<String>,
}

fn players_by_id<S: Serializer>(players: &[PlayerProfile], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_map(players.iter().map(|p| (&p.id, p)))
}

impl RaceQueueEntry {
    fn new(track_id: &str) -> Self {
        Self {
            track_id: track_id.to_string(),
            players: Vec::new(),
            players_ready: Vec::new(),
        }
    }

    fn is_everyone_ready(&self) -> bool {
        !self.players.is_empty() && self.players_ready.len() == self.players.len()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RaceQueueEnter<'a> {
    track_id: &'a str,
    player: &'a PlayerProfile,
}

/// Payload of both `Race_Queue_Leave` and `Race_Queue_Ready`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RaceQueuePlayer<'a> {
    track_id: &'a str,
    player_id: &'a str,
}

#[derive(Default)]
struct QueueTable {
    entries: HashMap<String, RaceQueueEntry>,
    /// Which track each queued player waits for
    queued: HashMap<String, String>,
}

impl QueueTable {
    /// Take a player out of its lobby, dropping the lobby once empty.
    /// Returns the track the player was queued for.
    fn remove_player(&mut self, player_id: &str) -> Option<String> {
        let track_id = self.queued.remove(player_id)?;

        if let Some(entry) = self.entries.get_mut(&track_id) {
            entry.players.retain(|p| p.id != player_id);
            entry.players_ready.retain(|id| id != player_id);
            if entry.players.is_empty() {
                self.entries.remove(&track_id);
            }
        }

        Some(track_id)
    }
}

pub struct RaceQueue {
    db: Database,
    connections: Arc<ConnectionRegistry>,
    races: Arc<RaceSessions>,
    client_data: Arc<ClientDataCache>,
    table: Mutex<QueueTable>,
}

impl RaceQueue {
    pub fn new(
        db: Database,
        connections: Arc<ConnectionRegistry>,
        races: Arc<RaceSessions>,
        client_data: Arc<ClientDataCache>,
    ) -> Self {
        Self {
            db,
            connections,
            races,
            client_data,
            table: Mutex::new(QueueTable::default()),
        }
    }

    /// Put a player into the lobby of `track_id`, leaving any other lobby.
    pub async fn enqueue(&self, player_id: &str, track_id: &str) -> Result<(), SessionError> {
        let already_here = {
            let table = self.table.lock().await;
            table.queued.get(player_id).is_some_and(|t| t == track_id)
        };
        if already_here {
            // The client missed the first notification; tell only them again
            let player = self.db.get_player_profile(player_id.to_string()).await?;
            self.connections
                .send(player_id, "Race_Queue_Enter", &RaceQueueEnter { track_id, player: &player })
                .await;
            return Ok(());
        }

        self.dequeue(player_id).await;

        let lobby_exists = self.table.lock().await.entries.contains_key(track_id);
        if !lobby_exists && !self.db.track_exists(track_id.to_string()).await? {
            return Err(SessionError::TrackNotFound);
        }
        let player = self.db.get_player_profile(player_id.to_string()).await?;

        let mut table = self.table.lock().await;
        match table.queued.get(player_id).cloned() {
            Some(current) if current == track_id => return Ok(()),
            Some(_) => {
                if let Some(previous) = table.remove_player(player_id) {
                    self.broadcast_leave(&previous, player_id).await;
                }
            }
            None => {}
        }

        table
            .entries
            .entry(track_id.to_string())
            .or_insert_with(|| RaceQueueEntry::new(track_id))
            .players
            .push(player.clone());
        table.queued.insert(player_id.to_string(), track_id.to_string());

        tracing::debug!(player_id, track_id, "Player queued");
        self.connections
            .send_global("Race_Queue_Enter", &RaceQueueEnter { track_id, player: &player })
            .await;
        Ok(())
    }

    /// Take a player out of its lobby. No-op if the player is not queued.
    pub async fn dequeue(&self, player_id: &str) {
        let mut table = self.table.lock().await;
        if let Some(track_id) = table.remove_player(player_id) {
            tracing::debug!(player_id, track_id = %track_id, "Player left queue");
            self.broadcast_leave(&track_id, player_id).await;
        }
    }

    /// Mark a player ready. When the whole lobby is ready the race starts.
    pub async fn set_ready(&self, player_id: &str) {
        let formed = {
            let mut table = self.table.lock().await;
            let Some(track_id) = table.queued.get(player_id).cloned() else {
                return;
            };
            let Some(entry) = table.entries.get_mut(&track_id) else {
                return;
            };

            if !entry.players_ready.iter().any(|id| id == player_id) {
                entry.players_ready.push(player_id.to_string());
            }

            if !entry.is_everyone_ready() {
                self.connections
                    .send_global(
                        "Race_Queue_Ready",
                        &RaceQueuePlayer {
                            track_id: &track_id,
                            player_id,
                        },
                    )
                    .await;
                return;
            }

            let Some(entry) = table.entries.remove(&track_id) else {
                return;
            };
            for player in &entry.players {
                table.queued.remove(&player.id);
            }

            // Lobbies disappear for everyone even if the race fails to start
            self.connections
                .send_global("Race_Queue_Clear", &track_id)
                .await;
            entry
        };

        self.start_race(formed).await;
    }

    /// Players whose race cannot be started stay out of the queue without a
    /// race; they have to enqueue again.
    async fn start_race(&self, entry: RaceQueueEntry) {
        let track = match self.db.get_track(entry.track_id.clone()).await {
            Ok(track) => track,
            Err(err) => {
                tracing::error!(track_id = %entry.track_id, ?err, "Failed to start race");
                return;
            }
        };

        let race = Race {
            id: generate_id(),
            start_time: now_millis(),
            players: entry.players,
            track,
        };
        let roster: Vec<String> = race.players.iter().map(|p| p.id.clone()).collect();

        self.races.start(race.clone()).await;
        self.connections.send_many(&roster, "Race_Start", &race).await;

        let db = self.db.clone();
        let client_data = self.client_data.clone();
        let track_id = entry.track_id;
        let amount = roster.len() as i64;
        tokio::spawn(async move {
            if let Err(err) = db.increment_track_plays(track_id.clone(), amount).await {
                tracing::warn!(track_id = %track_id, ?err, "Failed to increment track plays");
                return;
            }
            if let Err(err) = client_data.increment_plays(&track_id, amount).await {
                tracing::warn!(track_id = %track_id, ?err, "Failed to mirror track plays");
            }
        });
    }

    async fn broadcast_leave(&self, track_id: &str, player_id: &str) {
        self.connections
            .send_global("Race_Queue_Leave", &RaceQueuePlayer { track_id, player_id })
            .await;
    }

    /// All lobbies by track id.
    pub async fn snapshot(&self) -> HashMap<String, RaceQueueEntry> {
        self.table.lock().await.entries.clone()
    }

    /// Register a connection with the lobbies held still. `announce` sees the
    /// lobbies as the new connection must be told about them; every later
    /// lobby change reaches the connection as a broadcast.
    pub async fn register_connection<F>(&self, player_id: &str, handle: ConnectionHandle, announce: F)
    where
        F: FnOnce(&HashMap<String, RaceQueueEntry>),
    {
        let table = self.table.lock().await;
        announce(&table.entries);
        self.connections.register(player_id, handle).await;
    }

    pub async fn entry(&self, track_id: &str) -> Option<RaceQueueEntry> {
        self.table.lock().await.entries.get(track_id).cloned()
    }

    pub async fn queued_track(&self, player_id: &str) -> Option<String> {
        self.table.lock().await.queued.get(player_id).cloned()
    }
}
