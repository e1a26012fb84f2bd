mod error;
mod models;
mod tiles;

pub use error::{DbError, Result};
pub use models::{
  EffectTrigger, Matter, Player, PlayerProfile, Ticket, Tile, TileCoords, TileEffect, Track,
  TrackInfo,
};

use std::collections::BTreeMap;
use std::path::Path;
use tokio_rusqlite::Connection;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, Row, params, types::Type};
use tracing::{debug, info};

const TRACK_COLUMNS: &str = "t.id, t.created_at, t.name, t.plays, p.name, t.tile_coords";

const TRACK_INFO_COLUMNS: &str = "t.id, t.name, p.name, t.created_at, t.plays";

/// Database wrapper for all persistent game state.
#[derive(Clone)]
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create a database at the given path.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = Connection::open(path).await.map_err(DbError::Sqlite)?;
    let db = Self { conn };
    db.initialize().await?;
    Ok(db)
  }

  /// Create an in-memory database (useful for testing).
  pub async fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .await
      .map_err(DbError::Sqlite)?;
    let db = Self { conn };
    db.initialize().await?;
    Ok(db)
  }

  /// Initialize the database schema.
  async fn initialize(&self) -> Result<()> {
    self.conn
            .call(|conn| {
                conn.pragma_update(None, "journal_mode", "WAL")?;

                // Enable foreign key constraints (must be set per-connection)
                conn.pragma_update(None, "foreign_keys", "ON")?;

                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS players (
                        id TEXT PRIMARY KEY,
                        name TEXT NOT NULL,
                        email TEXT,
                        level INTEGER NOT NULL DEFAULT 0,
                        is_guest INTEGER NOT NULL DEFAULT 0,
                        created_at INTEGER NOT NULL,
                        last_seen INTEGER NOT NULL
                    );

                    -- Session tickets, one per login
                    CREATE TABLE IF NOT EXISTS tickets (
                        id TEXT PRIMARY KEY,
                        player_id TEXT NOT NULL REFERENCES players(id) ON DELETE CASCADE,
                        is_guest INTEGER NOT NULL DEFAULT 0,
                        created_at INTEGER NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS tracks (
                        id TEXT PRIMARY KEY,
                        player_id TEXT NOT NULL REFERENCES players(id) ON DELETE CASCADE,
                        name TEXT NOT NULL,
                        tile_coords TEXT NOT NULL,
                        plays INTEGER NOT NULL DEFAULT 0,
                        created_at INTEGER NOT NULL,
                        updated_at INTEGER NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_tickets_player ON tickets(player_id);
                    CREATE INDEX IF NOT EXISTS idx_tracks_player ON tracks(player_id);
                    CREATE INDEX IF NOT EXISTS idx_tracks_updated ON tracks(updated_at);
                    "#,
                )?;
                Ok(())
            })
            .await?;

    info!("database initialized");
    Ok(())
  }

  // ========================================================================
  // Tickets
  // ========================================================================

  /// Get a ticket by id.
  /// Returns None if not found.
  pub async fn get_ticket(&self, id: String) -> Result<Option<Ticket>> {
    let ticket = self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached("SELECT id, player_id, is_guest, created_at FROM tickets WHERE id = ?1")?
          .query_row(params![&id], ticket_from_row)
          .optional()
      })
      .await?;

    Ok(ticket)
  }

  /// Get the newest ticket issued to a player.
  pub async fn get_ticket_for_player_id(&self, player_id: String) -> Result<Option<Ticket>> {
    let ticket = self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(
            "SELECT id, player_id, is_guest, created_at FROM tickets WHERE player_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
          )?
          .query_row(params![&player_id], ticket_from_row)
          .optional()
      })
      .await?;

    Ok(ticket)
  }

  /// Store a new ticket for an existing player.
  pub async fn create_ticket(
    &self,
    id: String,
    player_id: String,
    is_guest: bool,
    now: i64,
  ) -> Result<Ticket> {
    let ticket = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let exists: bool = tx
          .prepare_cached("SELECT EXISTS(SELECT 1 FROM players WHERE id = ?1)")?
          .query_row(params![&player_id], |row| row.get(0))?;

        if !exists {
          return Ok(Err(DbError::PlayerNotFound));
        }

        tx.prepare_cached(
          "INSERT INTO tickets (id, player_id, is_guest, created_at) VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![&id, &player_id, is_guest, now])?;

        tx.commit()?;
        Ok(Ok(Ticket {
          id,
          player_id,
          is_guest,
          created_at: now,
        }))
      })
      .await??;

    debug!(player_id = %ticket.player_id, ticket.is_guest, "created ticket");
    Ok(ticket)
  }

  /// Delete a ticket. Deleting an unknown ticket is not an error.
  pub async fn delete_ticket(&self, id: String) -> Result<()> {
    let deleted = self
      .conn
      .call(move |conn| {
        let deleted = conn
          .prepare_cached("DELETE FROM tickets WHERE id = ?1")?
          .execute(params![&id])?;
        Ok(deleted)
      })
      .await?;

    debug!(deleted, "deleted ticket");
    Ok(())
  }

  // ========================================================================
  // Players
  // ========================================================================

  /// Register a new player.
  pub async fn create_player(
    &self,
    id: String,
    name: String,
    email: Option<String>,
    now: i64,
  ) -> Result<PlayerProfile> {
    let profile = self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(
            "INSERT INTO players (id, name, email, is_guest, created_at, last_seen) VALUES (?1, ?2, ?3, 0, ?4, ?4)",
          )?
          .execute(params![&id, &name, &email, now])?;

        Ok(PlayerProfile {
          id,
          name,
          level: 0,
          last_seen: now,
        })
      })
      .await?;

    debug!(player_id = %profile.id, "created player");
    Ok(profile)
  }

  /// Register a guest player together with its ticket, atomically.
  pub async fn create_guest(
    &self,
    player_id: String,
    name: String,
    ticket_id: String,
    now: i64,
  ) -> Result<Ticket> {
    let ticket = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        tx.prepare_cached(
          "INSERT INTO players (id, name, email, is_guest, created_at, last_seen) VALUES (?1, ?2, NULL, 1, ?3, ?3)",
        )?
        .execute(params![&player_id, &name, now])?;

        tx.prepare_cached(
          "INSERT INTO tickets (id, player_id, is_guest, created_at) VALUES (?1, ?2, 1, ?3)",
        )?
        .execute(params![&ticket_id, &player_id, now])?;

        tx.commit()?;
        Ok(Ticket {
          id: ticket_id,
          player_id,
          is_guest: true,
          created_at: now,
        })
      })
      .await?;

    debug!(player_id = %ticket.player_id, "created guest");
    Ok(ticket)
  }

  /// Delete a player. Tickets and tracks go with it.
  pub async fn delete_player(&self, id: String) -> Result<()> {
    let result = self
      .conn
      .call(move |conn| {
        let deleted = conn
          .prepare_cached("DELETE FROM players WHERE id = ?1")?
          .execute(params![&id])?;

        if deleted == 0 {
          return Ok(Err(DbError::PlayerNotFound));
        }

        Ok(Ok(()))
      })
      .await??;

    debug!("deleted player");
    Ok(result)
  }

  /// Get a player with the summaries of every track they authored.
  pub async fn get_full_player(&self, id: String) -> Result<Player> {
    let player = self
      .conn
      .call(move |conn| {
        let player = conn
          .prepare_cached(
            "SELECT id, created_at, last_seen, email, level, name, is_guest FROM players WHERE id = ?1",
          )?
          .query_row(params![&id], |row| {
            Ok(Player {
              id: row.get(0)?,
              created_at: row.get(1)?,
              last_seen: row.get(2)?,
              email: row.get(3)?,
              level: row.get(4)?,
              name: row.get(5)?,
              is_guest: row.get(6)?,
              track_infos: Vec::new(),
            })
          })
          .optional()?;

        let Some(mut player) = player else {
          return Ok(Err(DbError::PlayerNotFound));
        };

        let mut stmt = conn.prepare_cached(&format!(
          "SELECT {TRACK_INFO_COLUMNS} FROM tracks t JOIN players p ON p.id = t.player_id WHERE t.player_id = ?1 ORDER BY t.created_at DESC, t.rowid DESC"
        ))?;

        player.track_infos = stmt
          .query_map(params![&id], track_info_from_row)?
          .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Ok(player))
      })
      .await??;

    Ok(player)
  }

  /// Get the public profile of a player.
  pub async fn get_player_profile(&self, id: String) -> Result<PlayerProfile> {
    let profile = self
      .conn
      .call(move |conn| {
        let profile = conn
          .prepare_cached("SELECT id, name, level, last_seen FROM players WHERE id = ?1")?
          .query_row(params![&id], |row| {
            Ok(PlayerProfile {
              id: row.get(0)?,
              name: row.get(1)?,
              level: row.get(2)?,
              last_seen: row.get(3)?,
            })
          })
          .optional()?;

        Ok(profile.ok_or(DbError::PlayerNotFound))
      })
      .await??;

    Ok(profile)
  }

  /// Record when a player was last connected.
  pub async fn update_player_last_seen(&self, id: String, now: i64) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        let updated = conn
          .prepare_cached("UPDATE players SET last_seen = ?2 WHERE id = ?1")?
          .execute(params![&id, now])?;

        if updated == 0 {
          return Ok(Err(DbError::PlayerNotFound));
        }

        Ok(Ok(()))
      })
      .await??;

    Ok(())
  }

  // ========================================================================
  // Tiles
  // ========================================================================

  /// The tile catalogue. Tiles are static and not stored in SQLite.
  pub fn get_tiles(&self) -> Vec<Tile> {
    tiles::catalogue()
  }

  // ========================================================================
  // Tracks
  // ========================================================================

  /// Get a full track by id.
  pub async fn get_track(&self, id: String) -> Result<Track> {
    let track = self
      .conn
      .call(move |conn| {
        let track = select_track(conn, &id)?;
        Ok(track.ok_or(DbError::TrackNotFound))
      })
      .await??;

    Ok(track)
  }

  /// Check if a track exists.
  pub async fn track_exists(&self, id: String) -> Result<bool> {
    let exists = self
      .conn
      .call(move |conn| {
        let exists: bool = conn
          .prepare_cached("SELECT EXISTS(SELECT 1 FROM tracks WHERE id = ?1)")?
          .query_row(params![&id], |row| row.get(0))?;

        Ok(exists)
      })
      .await?;

    Ok(exists)
  }

  /// Publish a new track authored by `player_id`.
  pub async fn create_track(
    &self,
    id: String,
    player_id: String,
    name: String,
    tile_coords: TileCoords,
    now: i64,
  ) -> Result<Track> {
    let encoded = serde_json::to_string(&tile_coords)?;

    let track = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                tx.prepare_cached(
                    "INSERT INTO tracks (id, player_id, name, tile_coords, plays, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
                )?
                    .execute(params![&id, &player_id, &name, &encoded, now])?;

                let track = select_track(&tx, &id)?;
                tx.commit()?;
                Ok(track.ok_or(DbError::TrackNotFound))
            })
            .await??;

    debug!(track_id = %track.id, %track.name, "created track");
    Ok(track)
  }

  /// Replace name and geometry of a track. Only the author may do this; for
  /// anyone else the track does not exist.
  pub async fn update_track(
    &self,
    id: String,
    player_id: String,
    name: String,
    tile_coords: TileCoords,
    now: i64,
  ) -> Result<Track> {
    let encoded = serde_json::to_string(&tile_coords)?;

    let track = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let updated = tx
                    .prepare_cached(
                        "UPDATE tracks SET name = ?3, tile_coords = ?4, updated_at = ?5 WHERE id = ?1 AND player_id = ?2",
                    )?
                    .execute(params![&id, &player_id, &name, &encoded, now])?;

                if updated == 0 {
                    return Ok(Err(DbError::TrackNotFound));
                }

                let track = select_track(&tx, &id)?;
                tx.commit()?;
                Ok(track.ok_or(DbError::TrackNotFound))
            })
            .await??;

    debug!(track_id = %track.id, "updated track");
    Ok(track)
  }

  /// Delete a track owned by `player_id`.
  pub async fn delete_track(&self, player_id: String, id: String) -> Result<()> {
    let result = self
      .conn
      .call(move |conn| {
        let deleted = conn
          .prepare_cached("DELETE FROM tracks WHERE id = ?1 AND player_id = ?2")?
          .execute(params![&id, &player_id])?;

        if deleted == 0 {
          return Ok(Err(DbError::TrackNotFound));
        }

        Ok(Ok(()))
      })
      .await??;

    debug!("deleted track");
    Ok(result)
  }

  /// Add `amount` to the play counter of a track.
  pub async fn increment_track_plays(&self, id: String, amount: i64) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        let updated = conn
          .prepare_cached("UPDATE tracks SET plays = plays + ?2 WHERE id = ?1")?
          .execute(params![&id, amount])?;

        if updated == 0 {
          return Ok(Err(DbError::TrackNotFound));
        }

        Ok(Ok(()))
      })
      .await??;

    Ok(())
  }

  /// The most recently published tracks, newest first.
  pub async fn get_latest_tracks(&self, count: usize) -> Result<Vec<TrackInfo>> {
    let limit = count as i64;

    let tracks = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&format!(
          "SELECT {TRACK_INFO_COLUMNS} FROM tracks t JOIN players p ON p.id = t.player_id ORDER BY t.updated_at DESC, t.rowid DESC LIMIT ?1"
        ))?;

        let tracks = stmt
          .query_map(params![limit], track_info_from_row)?
          .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(tracks)
      })
      .await?;

    Ok(tracks)
  }
}

fn ticket_from_row(row: &Row<'_>) -> rusqlite::Result<Ticket> {
  Ok(Ticket {
    id: row.get(0)?,
    player_id: row.get(1)?,
    is_guest: row.get(2)?,
    created_at: row.get(3)?,
  })
}

fn track_info_from_row(row: &Row<'_>) -> rusqlite::Result<TrackInfo> {
  Ok(TrackInfo {
    id: row.get(0)?,
    name: row.get(1)?,
    author: row.get(2)?,
    created_at: row.get(3)?,
    plays: row.get(4)?,
  })
}

fn select_track(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<Option<Track>> {
  conn
    .prepare_cached(&format!(
      "SELECT {TRACK_COLUMNS} FROM tracks t JOIN players p ON p.id = t.player_id WHERE t.id = ?1"
    ))?
    .query_row(params![id], |row| {
      let encoded: String = row.get(5)?;
      let tile_coords: TileCoords = serde_json::from_str(&encoded)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

      Ok(Track {
        id: row.get(0)?,
        created_at: row.get(1)?,
        name: row.get(2)?,
        plays: row.get(3)?,
        author: row.get(4)?,
        custom_tiles: BTreeMap::new(),
        tile_coords,
      })
    })
    .optional()
}
