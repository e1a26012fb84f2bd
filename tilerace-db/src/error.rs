use thiserror::Error;
use tokio_rusqlite::rusqlite;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    #[error("tile coordinates could not be encoded: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("player not found")]
    PlayerNotFound,

    #[error("track not found")]
    TrackNotFound,

    #[error("ticket not found")]
    TicketNotFound,
}

impl DbError {
    /// Whether this error means the requested row does not exist, as opposed
    /// to the store itself failing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DbError::PlayerNotFound | DbError::TrackNotFound | DbError::TicketNotFound
        )
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
