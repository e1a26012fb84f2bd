use serde::{Serialize, Serializer};
use std::collections::BTreeMap;

/// Tile placements of a track: tile id (as a string key) to a flat list of
/// `x, y` pairs.
pub type TileCoords = BTreeMap<String, Vec<i32>>;

/// A session ticket. The id is the opaque bearer token clients send in the
/// `x-ticket` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,
    pub player_id: String,
    pub is_guest: bool,
    /// Unix timestamp when this ticket was issued
    pub created_at: i64,
}

/// The public part of a player, shown to other players in lobbies and races.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerProfile {
    pub id: String,
    pub name: String,
    pub level: i64,
    pub last_seen: i64,
}

/// Everything the owning player gets to know about themselves on connect.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: String,
    pub created_at: i64,
    pub last_seen: i64,
    pub email: Option<String>,
    pub level: i64,
    pub name: String,
    pub is_guest: bool,
    pub track_infos: Vec<TrackInfo>,
}

/// Summary of a track, used for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub id: String,
    pub name: String,
    pub author: String,
    pub created_at: i64,
    pub plays: i64,
}

/// A full track including its geometry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    pub created_at: i64,
    pub name: String,
    pub plays: i64,
    pub author: String,
    pub custom_tiles: BTreeMap<String, Tile>,
    pub tile_coords: TileCoords,
}

impl Track {
    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            author: self.author.clone(),
            created_at: self.created_at,
            plays: self.plays,
        }
    }
}

/// Physical matter of a tile, sent to clients as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Matter {
    Air = 0,
    Stone = 1,
}

impl Serialize for Matter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EffectTrigger {
    Init,
    Any,
    Bump,
    Stand,
    PushLeft,
    PushRight,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TileEffect {
    pub trigger: EffectTrigger,
    pub effect: &'static str,
}

/// A building block of tracks. The catalogue is static and shipped with the
/// server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tile {
    pub id: u32,
    pub name: &'static str,
    pub atlas_x: u32,
    pub atlas_y: u32,
    pub matter: Matter,
    pub safe: bool,
    pub friction: f32,
    pub listed: bool,
    pub effects: Vec<TileEffect>,
}
