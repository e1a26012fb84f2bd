use crate::queue::RaceQueueEntry;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tilerace_db::{Database, Player, Tile, TrackInfo};
use tokio::sync::{Mutex, OnceCell};

/// How many recently published tracks every new client is shown.
pub const LATEST_TRACKS_CAPACITY: usize = 12;

/// Initial snapshot pushed to a client right after it connects.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientData {
    pub tiles: Vec<Tile>,
    pub player: Player,
    pub latest_tracks: Vec<TrackInfo>,
    pub races_queue: HashMap<String, RaceQueueEntry>,
}

/// Recency list of published tracks, newest first, shared by all clients.
///
/// Loaded from the store on first use. Concurrent first callers share one
/// load.
pub struct ClientDataCache {
    db: Database,
    capacity: usize,
    latest: OnceCell<Mutex<VecDeque<TrackInfo>>>,
}

impl ClientDataCache {
    pub fn new(db: Database) -> Self {
        Self::with_capacity(db, LATEST_TRACKS_CAPACITY)
    }

    pub fn with_capacity(db: Database, capacity: usize) -> Self {
        Self {
            db,
            capacity,
            latest: OnceCell::new(),
        }
    }

    async fn latest(&self) -> tilerace_db::Result<&Mutex<VecDeque<TrackInfo>>> {
        self.latest
            .get_or_try_init(|| async {
                let tracks = self.db.get_latest_tracks(self.capacity).await?;
                tracing::debug!(count = tracks.len(), "Loaded latest tracks");
                Ok(Mutex::new(VecDeque::from(tracks)))
            })
            .await
    }

    pub async fn latest_tracks(&self) -> tilerace_db::Result<Vec<TrackInfo>> {
        let latest = self.latest().await?.lock().await;
        Ok(latest.iter().cloned().collect())
    }

    /// Move a new or changed track to the front.
    pub async fn publish(&self, track: TrackInfo) -> tilerace_db::Result<()> {
        let mut latest = self.latest().await?.lock().await;

        if let Some(position) = latest.iter().position(|t| t.id == track.id) {
            latest.remove(position);
        } else if latest.len() >= self.capacity {
            latest.pop_back();
        }

        latest.push_front(track);
        Ok(())
    }

    pub async fn delete(&self, track_id: &str) -> tilerace_db::Result<()> {
        let mut latest = self.latest().await?.lock().await;
        latest.retain(|t| t.id != track_id);
        Ok(())
    }

    /// Mirror a play counter bump. Tracks outside the window are ignored.
    pub async fn increment_plays(&self, track_id: &str, amount: i64) -> tilerace_db::Result<()> {
        let mut latest = self.latest().await?.lock().await;
        if let Some(track) = latest.iter_mut().find(|t| t.id == track_id) {
            track.plays += amount;
        }
        Ok(())
    }

    pub fn tiles(&self) -> Vec<Tile> {
        self.db.get_tiles()
    }
}
