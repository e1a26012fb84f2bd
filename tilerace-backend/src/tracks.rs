//! Track mutations shared by the HTTP routes and the socket handlers. Each
//! one keeps the recency cache in step with the store.

use crate::AppState;
use crate::helpers::{generate_id, now};
use std::sync::Arc;
use tilerace_db::{TileCoords, Track};

pub async fn get(state: &AppState, track_id: String) -> tilerace_db::Result<Track> {
    state.db.get_track(track_id).await
}

pub async fn create(
    state: &AppState,
    player_id: &str,
    name: String,
    tile_coords: TileCoords,
) -> tilerace_db::Result<Track> {
    let track = state
        .db
        .create_track(generate_id(), player_id.to_string(), name, tile_coords, now())
        .await?;

    tracing::info!(track_id = %track.id, player_id, "Track published");
    publish(state, &track).await;
    Ok(track)
}

pub async fn update(
    state: &AppState,
    player_id: &str,
    track_id: String,
    name: String,
    tile_coords: TileCoords,
) -> tilerace_db::Result<Track> {
    let track = state
        .db
        .update_track(track_id, player_id.to_string(), name, tile_coords, now())
        .await?;

    publish(state, &track).await;
    Ok(track)
}

pub async fn delete(state: &AppState, player_id: &str, track_id: String) -> tilerace_db::Result<()> {
    state
        .db
        .delete_track(player_id.to_string(), track_id.clone())
        .await?;

    if let Err(err) = state.client_data.delete(&track_id).await {
        tracing::warn!(track_id = %track_id, ?err, "Failed to drop track from latest tracks");
    }
    Ok(())
}

/// Fetch a track for playing and count the play in the background.
pub async fn play(state: &Arc<AppState>, track_id: String) -> tilerace_db::Result<Track> {
    let track = state.db.get_track(track_id.clone()).await?;

    let state = state.clone();
    tokio::spawn(async move {
        if let Err(err) = state.db.increment_track_plays(track_id.clone(), 1).await {
            tracing::warn!(track_id = %track_id, ?err, "Failed to increment track plays");
            return;
        }
        if let Err(err) = state.client_data.increment_plays(&track_id, 1).await {
            tracing::warn!(track_id = %track_id, ?err, "Failed to mirror track plays");
        }
    });

    Ok(track)
}

async fn publish(state: &AppState, track: &Track) {
    if let Err(err) = state.client_data.publish(track.info()).await {
        tracing::warn!(track_id = %track.id, ?err, "Failed to publish track to latest tracks");
    }
}
