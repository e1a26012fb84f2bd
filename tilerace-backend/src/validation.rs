/// Input validation shared by the HTTP routes and the WebSocket handlers
use thiserror::Error;
use tilerace_db::TileCoords;

const MAX_TRACK_NAME_LEN: usize = 50;
const MAX_TRACK_ID_LEN: usize = 64;
const MAX_TILE_COORDS: usize = 100_000;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Invalid track id")]
    TrackIdInvalid,

    #[error("Track name cannot be empty")]
    TrackNameEmpty,

    #[error("Track name too long (max 50 characters, got {0})")]
    TrackNameTooLong(usize),

    #[error("Tile coordinates for tile '{0}' must be a list of x, y pairs")]
    TileCoordsOdd(String),

    #[error("Tile key '{0}' is not a tile id")]
    TileKeyInvalid(String),

    #[error("Track too large (max {max} coordinates, got {actual})")]
    TrackTooLarge { max: usize, actual: usize },
}

/// Validates a track id received from a client
///
/// Rules:
/// - Cannot be empty
/// - Max 64 characters
pub fn validate_track_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() || id.len() > MAX_TRACK_ID_LEN {
        return Err(ValidationError::TrackIdInvalid);
    }

    Ok(())
}

/// Validates a track name
///
/// Rules:
/// - Cannot be empty or whitespace only
/// - Max 50 characters
pub fn validate_track_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::TrackNameEmpty);
    }

    let len = name.chars().count();
    if len > MAX_TRACK_NAME_LEN {
        return Err(ValidationError::TrackNameTooLong(len));
    }

    Ok(())
}

/// Validates the tile placements of a track
///
/// Rules:
/// - Keys are numeric tile ids
/// - Every list holds whole x, y pairs
/// - At most 100000 coordinates in total (prevents DOS)
pub fn validate_tile_coords(coords: &TileCoords) -> Result<(), ValidationError> {
    let mut total = 0;

    for (key, values) in coords {
        if key.parse::<u32>().is_err() {
            return Err(ValidationError::TileKeyInvalid(key.clone()));
        }

        if values.len() % 2 != 0 {
            return Err(ValidationError::TileCoordsOdd(key.clone()));
        }

        total += values.len();
    }

    if total > MAX_TILE_COORDS {
        return Err(ValidationError::TrackTooLarge {
            max: MAX_TILE_COORDS,
            actual: total,
        });
    }

    Ok(())
}
