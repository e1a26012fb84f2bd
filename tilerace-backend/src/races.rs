use crate::connections::ConnectionRegistry;
use crate::helpers::now_millis;
use crate::protocol::CharacterMotion;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tilerace_db::{PlayerProfile, Track};
use tokio::sync::Mutex;

/// A formed race. The roster is fixed at creation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Race {
    pub id: String,
    /// Unix time in milliseconds
    pub start_time: i64,
    pub players: Vec<PlayerProfile>,
    pub track: Track,
}

#[derive(Debug, Serialize)]
struct CharacterUpdate<'a> {
    id: &'a str,
    #[serde(flatten)]
    motion: CharacterMotion,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CharacterFinish<'a> {
    player_id: &'a str,
    /// Milliseconds since the race started
    time: i64,
}

struct ActiveRace {
    race: Race,
    finished: HashSet<String>,
    left: HashSet<String>,
}

impl ActiveRace {
    fn roster(&self) -> impl Iterator<Item = &str> {
        self.race.players.iter().map(|p| p.id.as_str())
    }

    fn is_over(&self) -> bool {
        self.roster()
            .all(|id| self.finished.contains(id) || self.left.contains(id))
    }
}

#[derive(Default)]
struct RaceTable {
    races: HashMap<String, ActiveRace>,
    player_races: HashMap<String, String>,
}

impl RaceTable {
    fn detach(&mut self, player_id: &str) {
        let Some(race_id) = self.player_races.remove(player_id) else {
            return;
        };

        if let Some(active) = self.races.get_mut(&race_id) {
            active.left.insert(player_id.to_string());
        }
        self.drop_if_over(&race_id);
    }

    fn drop_if_over(&mut self, race_id: &str) {
        let over = self.races.get(race_id).is_some_and(ActiveRace::is_over);
        if !over {
            return;
        }

        if let Some(active) = self.races.remove(race_id) {
            for id in active.roster() {
                if self.player_races.get(id).is_some_and(|r| r == race_id) {
                    self.player_races.remove(id);
                }
            }
            tracing::debug!(race_id, "Race over");
        }
    }
}

/// Relays in-race telemetry between the racers of each active race.
pub struct RaceSessions {
    connections: Arc<ConnectionRegistry>,
    table: Mutex<RaceTable>,
}

impl RaceSessions {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            connections,
            table: Mutex::new(RaceTable::default()),
        }
    }

    /// Start tracking a race. Racers still attached to an earlier race are
    /// detached from it first.
    pub async fn start(&self, race: Race) {
        let mut table = self.table.lock().await;
        for player in &race.players {
            table.detach(&player.id);
            table.player_races.insert(player.id.clone(), race.id.clone());
        }

        tracing::info!(race_id = %race.id, track_id = %race.track.id, players = race.players.len(), "Race started");
        table.races.insert(
            race.id.clone(),
            ActiveRace {
                race,
                finished: HashSet::new(),
                left: HashSet::new(),
            },
        );
    }

    /// Relay a racer's motion to the whole roster, the sender included.
    /// Players not in a race are ignored.
    pub async fn character_update(&self, player_id: &str, motion: CharacterMotion) {
        let recipients = {
            let table = self.table.lock().await;
            let Some(active) = table
                .player_races
                .get(player_id)
                .and_then(|race_id| table.races.get(race_id))
            else {
                return;
            };
            active.roster().map(str::to_string).collect::<Vec<_>>()
        };

        let update = CharacterUpdate {
            id: player_id,
            motion,
        };
        self.connections
            .send_many(&recipients, "Race_Character_Update", &update)
            .await;
    }

    /// Tell the other racers that `player_id` crossed the finish line.
    /// Repeated finishes are ignored.
    pub async fn character_finish(&self, player_id: &str) {
        let (recipients, time) = {
            let mut table = self.table.lock().await;
            let Some(race_id) = table.player_races.get(player_id).cloned() else {
                return;
            };
            let Some(active) = table.races.get_mut(&race_id) else {
                return;
            };
            if !active.finished.insert(player_id.to_string()) {
                return;
            }

            let time = now_millis() - active.race.start_time;
            let recipients = active
                .roster()
                .filter(|id| *id != player_id)
                .map(str::to_string)
                .collect::<Vec<_>>();

            tracing::debug!(race_id = %race_id, player_id, time, "Racer finished");
            table.drop_if_over(&race_id);
            (recipients, time)
        };

        let finish = CharacterFinish { player_id, time };
        self.connections
            .send_many(&recipients, "Race_Character_Finish", &finish)
            .await;
    }

    /// Detach a disconnected player from their race.
    pub async fn leave(&self, player_id: &str) {
        self.table.lock().await.detach(player_id);
    }

    pub async fn race_of(&self, player_id: &str) -> Option<String> {
        self.table.lock().await.player_races.get(player_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.races.len()
    }
}
